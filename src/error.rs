use thiserror::Error;

/// Session-layer error type
///
/// Errors are `Clone` because a single failure may be delivered to a pending
/// caller and, separately, broadcast to channel observers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Signaling transport failure: {0}")]
    Transport(String),

    #[error("Media engine failure: {0}")]
    MediaEngine(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Unknown(String),
}

impl SessionError {
    /// Whether this error came from the remote side or the network rather than
    /// from local validation
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unknown(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
