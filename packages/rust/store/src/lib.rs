//! Object store access for generated artifacts.
//!
//! [`ObjectBackend`] is the narrow seam the upload path depends on;
//! [`ObjectStoreBackend`] implements it over the `object_store` crate.
//! [`UploadClient`] adds bounded retries and lifetime counters on top.

mod backend;
mod upload;

use async_trait::async_trait;
use bytes::Bytes;
use reposcrape_shared::ObjectMetadata;

pub use backend::ObjectStoreBackend;
pub use upload::{RetryPolicy, UploadClient, UploadOutcome, UploadTotals};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure from a single backend call, classified for the retry loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Network, throttling or server-side failure. Worth another attempt.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Invalid key, payload refused, unsupported operation or failed precondition.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        use object_store::Error;
        match err {
            Error::InvalidPath { .. }
            | Error::NotSupported { .. }
            | Error::NotImplemented
            | Error::AlreadyExists { .. }
            | Error::Precondition { .. }
            | Error::UnknownConfigurationKey { .. } => Self::Rejected(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectBackend
// ---------------------------------------------------------------------------

/// Minimal object store surface used by the ingestion pipeline.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Write `body` at `key` with `metadata`. Overwrites are allowed.
    async fn put(&self, key: &str, body: Bytes, metadata: &ObjectMetadata)
    -> Result<(), StoreError>;

    /// Read the object at `key`, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys under `prefix` (all keys if `None`), sorted.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// Reachability check used before a run starts.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_of_object_store_errors() {
        let rejected: StoreError = object_store::Error::NotImplemented.into();
        assert!(!rejected.is_retryable());

        let transient: StoreError = object_store::Error::Generic {
            store: "S3",
            source: "connection reset".into(),
        }
        .into();
        assert!(transient.is_retryable());

        let not_found: StoreError = object_store::Error::NotFound {
            path: "a/b".into(),
            source: "missing".into(),
        }
        .into();
        assert!(not_found.is_retryable());
    }
}
