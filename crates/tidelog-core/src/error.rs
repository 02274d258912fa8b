//! Error types for WAL operations.

use thiserror::Error;

/// A specialized `Result` type for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Errors that can occur in the WAL subsystem.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log record failed its integrity checks.
    #[error("corrupt wal record: {0}")]
    Corrupt(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A batched write could not be made durable.
    #[error("wal write failed: {0}")]
    Write(String),

    /// A wait exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The node was closed while the operation was pending.
    #[error("wal node closed")]
    Closed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The storage engine rejected or failed a callback.
    #[error("storage engine error: {0}")]
    Upstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: WalError = io.into();
        assert!(matches!(err, WalError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_display() {
        assert_eq!(WalError::Closed.to_string(), "wal node closed");
        assert_eq!(
            WalError::Timeout("flush").to_string(),
            "timed out waiting for flush"
        );
    }
}
