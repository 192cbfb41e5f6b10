//! Error types for the outreach pipeline.
//!
//! Library crates use [`OutreachError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`StageError`] is the narrower taxonomy stage workers report. It never
//! propagates into the dispatcher: the stage runner turns it into a retry or
//! a terminal stage result.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OutreachError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a stage attempt (client setup, etc.).
    #[error("network error: {0}")]
    Network(String),

    /// HTML or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Work-unit encoding or queue bookkeeping error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input or a rejected operator request.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced job or entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, OutreachError>;

impl OutreachError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A missing record of the given kind.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// Failure reported by a stage worker for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Timeout, connection reset, 5xx. Retried with exponential backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed URL, unsupported site, empty content. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Rate limit or quota. Retried on a longer, separate schedule.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
            retry_after,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// The bare reason, without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
            Self::ResourceExhausted { message, .. } => message,
        }
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::ResourceExhausted { .. } => "resource_exhausted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = OutreachError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = OutreachError::not_found("job", "0190-abc");
        assert_eq!(err.to_string(), "job not found: 0190-abc");
    }

    #[test]
    fn stage_error_classification() {
        assert!(StageError::transient("connection reset").is_retryable());
        assert!(StageError::rate_limited("429", None).is_retryable());
        assert!(!StageError::permanent("malformed URL").is_retryable());

        let err = StageError::rate_limited("quota", Some(Duration::from_secs(30)));
        assert_eq!(err.reason(), "quota");
        assert_eq!(err.kind(), "resource_exhausted");
    }
}
