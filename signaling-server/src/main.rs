use log::{error, info};

use heartsync_signaling::config::Config;
use heartsync_signaling::server;

#[tokio::main]
async fn main() {
    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if std::env::args().any(|a| a == "--healthcheck") {
        use std::net::TcpListener;
        let port = healthcheck_port(std::env::var("PORT").ok().as_deref());
        match TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, port)) {
            Ok(_) => std::process::exit(1), // Port free = server NOT running
            Err(_) => std::process::exit(0), // Port in use = server IS running (healthy)
        }
    }

    env_logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    info!("Sync lock resets {:?} after an unlock", config.unlock_reset_after);

    if let Err(e) = server::run(config).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Only `PORT` matters to the healthcheck, so a bad value elsewhere in the
/// environment cannot fail the probe.
fn healthcheck_port(raw: Option<&str>) -> u16 {
    raw.and_then(|p| p.parse().ok()).unwrap_or(9001)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthcheck_port_falls_back_to_default() {
        assert_eq!(healthcheck_port(Some("3000")), 3000);
        assert_eq!(healthcheck_port(Some("not-a-port")), 9001);
        assert_eq!(healthcheck_port(None), 9001);
    }
}
