use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Passcode required")]
    PasscodeRequired,

    #[error("Authentication not configured")]
    NotConfigured,

    #[error("Invalid passcode")]
    InvalidPasscode,

    #[error("Too many attempts, please try again later")]
    RateLimited,

    #[error("No token provided")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Failed to sign session token: {0}")]
    Signing(String),
}

/// Failures while handling a single WebSocket frame. These are reported back
/// to the sender; the connection stays open.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Hub is not running")]
    HubClosed,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),
}
