//! Error types for reposcrape.
//!
//! Library crates use [`ReposcrapeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all reposcrape operations.
#[derive(Debug, thiserror::Error)]
pub enum ReposcrapeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the feed, KV proxy, or index.
    #[error("network error: {0}")]
    Network(String),

    /// Response or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Change-marker cache error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Object store error that escaped the upload client.
    #[error("store error: {0}")]
    Store(String),

    /// Artifact generation failed for an item.
    #[error("generation error: {0}")]
    Generation(String),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Index reconciliation trigger error.
    #[error("index error: {0}")]
    Index(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed input (descriptor identity, change marker, shard arguments).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Cache or store unreachable before a run started. Fatal to the run.
    #[error("infrastructure unavailable: {0}")]
    Infrastructure(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ReposcrapeError>;

impl ReposcrapeError {
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

    /// Whether this error means the run must not start at all.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ReposcrapeError::config("missing bucket");
        assert_eq!(err.to_string(), "config error: missing bucket");

        let err = ReposcrapeError::validation("change marker 'yesterday' is not RFC 3339");
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn timeout_display_names_operation() {
        let err = ReposcrapeError::Timeout {
            operation: "generation",
            after: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "generation timed out after 300s");
    }

    #[test]
    fn only_infrastructure_is_fatal() {
        assert!(ReposcrapeError::Infrastructure("cache down".into()).is_infrastructure());
        assert!(!ReposcrapeError::Cache("cache down".into()).is_infrastructure());
    }
}
