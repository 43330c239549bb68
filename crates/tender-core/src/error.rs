//! Error types for the tender pipeline.

use thiserror::Error;

/// Result type alias using the pipeline's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every tender crate.
///
/// Expected business conditions on the enqueue paths (duplicate, disabled,
/// invalid) are reported through structured outcomes, not through this type.
/// The `InvalidInput`, `Unavailable` and `Duplicate` variants exist for the
/// callers that do need to propagate them.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input supplied by a caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Queue disabled or not configured
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Rejected by the in-flight dedup guard
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Message broker connection, channel, or publish failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Notification payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Archive could not be extracted
    #[error("Archive error: {0}")]
    Archive(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for broker and database faults that a retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Broker(_) | Error::Database(_) | Error::Request(_) | Error::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("notice 42".to_string());
        assert_eq!(err.to_string(), "Not found: notice 42");
    }

    #[test]
    fn test_error_display_unavailable() {
        let err = Error::Unavailable("analysis queue disabled".to_string());
        assert_eq!(err.to_string(), "Unavailable: analysis queue disabled");
    }

    #[test]
    fn test_error_display_duplicate() {
        let err = Error::Duplicate("u1:q1".to_string());
        assert_eq!(err.to_string(), "Duplicate: u1:q1");
    }

    #[test]
    fn test_error_display_broker() {
        let err = Error::Broker("connection refused".to_string());
        assert_eq!(err.to_string(), "Broker error: connection refused");
    }

    #[test]
    fn test_error_display_parse() {
        let err = Error::Parse("unexpected end of input".to_string());
        assert_eq!(err.to_string(), "Parse error: unexpected end of input");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.zip");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("missing.zip"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Broker("x".into()).is_transient());
        assert!(Error::Timeout("x".into()).is_transient());
        assert!(!Error::InvalidInput("x".into()).is_transient());
        assert!(!Error::Unavailable("x".into()).is_transient());
        assert!(!Error::Duplicate("x".into()).is_transient());
    }
}
