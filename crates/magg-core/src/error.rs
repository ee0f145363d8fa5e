//! Error types for magg

use thiserror::Error;

/// Main error type for magg operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Reload error: {0}")]
    Reload(String),

    #[error("Configuration is read-only: {0}")]
    ReadOnly(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Error::Spawn(msg.into())
    }

    /// Create a connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    /// Create a handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a mount error
    pub fn mount(msg: impl Into<String>) -> Self {
        Error::Mount(msg.into())
    }

    /// Create a reload error
    pub fn reload(msg: impl Into<String>) -> Self {
        Error::Reload(msg.into())
    }

    /// Create a read-only error
    pub fn read_only(msg: impl Into<String>) -> Self {
        Error::ReadOnly(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Whether this error means one backend failed to come up, leaving magg healthy
    pub fn is_mount_failure(&self) -> bool {
        matches!(
            self,
            Error::Spawn(_) | Error::Connect(_) | Error::Handshake(_) | Error::Mount(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_failure_classification() {
        assert!(Error::spawn("no such binary").is_mount_failure());
        assert!(Error::connect("refused").is_mount_failure());
        assert!(Error::handshake("bad init").is_mount_failure());
        assert!(!Error::validation("bad prefix").is_mount_failure());
        assert!(!Error::fatal("cannot write config").is_mount_failure());
    }
}
