//! Error types for the dApp bridge

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the dApp bridge
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    // Relay transport errors
    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Relay handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("Relay channel closed")]
    ChannelClosed,

    // Wire errors
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    // Request registry errors
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    // Manager lifecycle errors
    #[error("Manager is not running")]
    NotRunning,

    #[error("Manager is already running")]
    AlreadyRunning,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::HandshakeTimeout(_) | Error::ChannelClosed
        )
    }

    /// A resolve that lost the race against expiry (or named an unknown id).
    /// Callers treat it as informative, not as a failure.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::RequestNotFound(_))
    }

    /// Caller contract violations
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Error::NotRunning | Error::AlreadyRunning | Error::InvalidIdentity(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from HTTP client errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

// Conversion from WebSocket errors
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

// Conversion from URL parse errors
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", e))
    }
}
