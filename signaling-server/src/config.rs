use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use log::{info, warn};

use crate::error::ConfigError;

const DEV_SESSION_SECRET: &str = "heartsync-dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub auth_passcode: Option<String>,
    pub session_secret: String,
    pub session_ttl: chrono::Duration,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub socket_require_auth: bool,
    pub unlock_reset_after: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host: String = try_load(&lookup, "BIND_ADDR", "0.0.0.0")?;
        let port: u16 = try_load(&lookup, "PORT", "9001")?;
        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "BIND_ADDR",
                value: host.clone(),
                reason: e.to_string(),
            })?;

        let session_secret = lookup("SESSION_SECRET").unwrap_or_else(|| {
            warn!("SESSION_SECRET not set, using development secret");
            DEV_SESSION_SECRET.to_string()
        });

        let auth_passcode = lookup("AUTH_PASSCODE").filter(|p| !p.is_empty());
        if auth_passcode.is_none() {
            warn!("AUTH_PASSCODE not set, passcode login is disabled");
        }

        let ttl_hours: u32 = try_load(&lookup, "SESSION_TTL_HOURS", "168")?;
        let session_ttl = session_ttl_hours(ttl_hours)?;
        let reset_secs: u64 = try_load(&lookup, "UNLOCK_RESET_SECS", "5")?;

        Ok(Self {
            bind_addr,
            auth_passcode,
            session_secret,
            session_ttl,
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|v| split_origins(&v))
                .unwrap_or_default(),
            socket_require_auth: try_load(&lookup, "SOCKET_REQUIRE_AUTH", "false")?,
            unlock_reset_after: Duration::from_secs(reset_secs),
        })
    }

    /// Value for `Access-Control-Allow-Origin`, or `None` if the origin is not allowed.
    pub fn cors_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.is_empty() {
            return Some("*".to_string());
        }
        origin
            .filter(|o| self.allowed_origins.iter().any(|a| a == o))
            .map(str::to_string)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            auth_passcode: None,
            session_secret: DEV_SESSION_SECRET.to_string(),
            session_ttl: chrono::Duration::hours(168),
            allowed_origins: Vec::new(),
            socket_require_auth: false,
            unlock_reset_after: Duration::from_secs(5),
        }
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

fn session_ttl_hours(hours: u32) -> Result<chrono::Duration, ConfigError> {
    if hours == 0 {
        return Err(ConfigError::Invalid {
            key: "SESSION_TTL_HOURS",
            value: hours.to_string(),
            reason: "must be at least one hour".to_string(),
        });
    }
    chrono::Duration::try_hours(i64::from(hours)).ok_or_else(|| ConfigError::Invalid {
        key: "SESSION_TTL_HOURS",
        value: hours.to_string(),
        reason: "out of range".to_string(),
    })
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.clone(),
        reason: e.to_string(),
    })
}
