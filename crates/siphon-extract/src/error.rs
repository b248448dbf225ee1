//! Error types for siphon-extract
//!
//! `ExtractError` is the terminal error of a descriptor (or of startup, for
//! configuration problems). `SinkError` is what destinations report; its
//! variant decides whether the write is repeated.

use thiserror::Error;

/// Result type alias for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors that end a descriptor or the whole job
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Invalid configuration; raised before any fetch
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient source failures outlasted the retry budget
    #[error("source unavailable after {attempts} attempts: {source}")]
    SourceUnavailable {
        attempts: u32,
        #[source]
        source: siphon_rdbc::Error,
    },

    /// Non-retriable SQL failure (syntax, permission, missing table, no key)
    #[error("query error: {0}")]
    Query(#[source] siphon_rdbc::Error),

    /// Destination rejected a batch
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Cooperative cancellation observed between batches
    #[error("cancelled")]
    Cancelled,

    /// Local I/O failure (checkpoint, output directory)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable short name used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Query(_) => "query",
            Self::Sink(_) => "sink",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether this is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors reported by a destination sink
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Write may succeed if repeated
    #[error("transient write failure: {0}")]
    Transient(String),

    /// Write will not succeed
    #[error("fatal write failure: {0}")]
    Fatal(String),
}

impl SinkError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the write may be repeated
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(err.to_string())
    }
}

impl From<siphon_rdbc::Error> for SinkError {
    fn from(err: siphon_rdbc::Error) -> Self {
        if err.is_retriable() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_errors_follow_retry_classification() {
        let lost = SinkError::from(siphon_rdbc::Error::connection("reset by peer"));
        assert!(lost.is_transient());

        let dup = SinkError::from(siphon_rdbc::error::classify_sqlstate("23505", "duplicate key", None));
        assert!(!dup.is_transient());
    }

    #[test]
    fn test_io_errors_are_fatal() {
        let err = SinkError::from(std::io::Error::other("disk full"));
        assert_eq!(err, SinkError::Fatal("disk full".into()));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ExtractError::config("x").kind(), "config");
        assert_eq!(ExtractError::Cancelled.kind(), "cancelled");
        let err = ExtractError::SourceUnavailable {
            attempts: 3,
            source: siphon_rdbc::Error::timeout("slow"),
        };
        assert_eq!(err.kind(), "source_unavailable");
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
