//! Error types for Newsdesk.
//!
//! Library crates use [`NewsdeskError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Newsdesk operations.
#[derive(Debug, thiserror::Error)]
pub enum NewsdeskError {
    /// Configuration loading or validation error. Fatal at start-up.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to an outlet.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or response decoding error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The storage layer kept failing after every reconnect attempt.
    #[error("connection timed out after {attempts} attempt(s): {message}")]
    ConnectionTimeout { attempts: u32, message: String },

    /// A looked-up row or named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Summarizer/extractor delegate failure (transport, status, or schema).
    #[error("delegate error: {0}")]
    Delegate(String),

    /// A pool, choker or queue was shut down while the caller waited on it.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NewsdeskError>;

impl NewsdeskError {
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

    /// Create a not-found error naming what was looked up.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for [`NewsdeskError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = NewsdeskError::config("missing harvest_interval_secs");
        assert_eq!(err.to_string(), "config error: missing harvest_interval_secs");

        let err = NewsdeskError::ConnectionTimeout {
            attempts: 5,
            message: "database is locked".into(),
        };
        assert!(err.to_string().contains("after 5 attempt(s)"));
    }

    #[test]
    fn not_found_is_typed() {
        let err = NewsdeskError::not_found("session (is_finished = false)");
        assert!(err.is_not_found());
        assert!(!NewsdeskError::Storage("boom".into()).is_not_found());
    }
}
