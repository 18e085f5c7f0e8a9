//! Retrying upload client with lifetime counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reposcrape_shared::{ObjectMetadata, StoreConfig};
use serde_json::json;
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

use crate::{ObjectBackend, StoreError};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first included. Never below 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delays slept between attempts: `max_attempts - 1` values doubling from
    /// `initial_backoff`, each capped at `max_backoff`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let cap = self.max_backoff;
        std::iter::successors(Some(self.initial_backoff.min(cap)), move |d| {
            Some(d.saturating_mul(2).min(cap))
        })
        .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Result of one logical upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub success: bool,
    /// Backend calls made, retries included.
    pub attempts: u32,
    pub bytes_written: u64,
    pub error: Option<StoreError>,
}

/// Snapshot of the client's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UploadTotals {
    pub total_uploaded: u64,
    pub total_failed: u64,
    pub total_bytes: u64,
}

impl UploadTotals {
    /// Percentage of uploads that succeeded, 0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.total_uploaded + self.total_failed;
        if attempted == 0 {
            return 0.0;
        }
        self.total_uploaded as f64 / attempted as f64 * 100.0
    }

    pub fn total_megabytes(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Structured form for audit logs.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "totalUploaded": self.total_uploaded,
            "totalFailed": self.total_failed,
            "totalBytes": self.total_bytes,
            "totalMegabytes": self.total_megabytes(),
            "successRate": self.success_rate(),
        })
    }
}

/// Uploads artifacts through an [`ObjectBackend`], retrying transient failures.
///
/// Counters live as long as the client and are shared by every run that uses it.
pub struct UploadClient {
    backend: Arc<dyn ObjectBackend>,
    policy: RetryPolicy,
    total_uploaded: AtomicU64,
    total_failed: AtomicU64,
    total_bytes: AtomicU64,
}

impl UploadClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            total_uploaded: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Upload `content` at `key`. Failures are reported in the outcome, never raised.
    #[instrument(skip_all, fields(key = %key, bytes = content.len()))]
    pub async fn upload(
        &self,
        key: &str,
        content: Bytes,
        metadata: &ObjectMetadata,
    ) -> UploadOutcome {
        let size = content.len() as u64;
        let attempts = AtomicU32::new(0);
        let result = self.put_with_retry(key, content, metadata, &attempts).await;
        self.settle(result, attempts.load(Ordering::Relaxed), size)
    }

    /// Like [`UploadClient::upload`], but the whole retry sequence must finish
    /// within `deadline`. An expired deadline is a failed upload.
    #[instrument(skip_all, fields(key = %key, bytes = content.len()))]
    pub async fn upload_within(
        &self,
        key: &str,
        content: Bytes,
        metadata: &ObjectMetadata,
        deadline: Duration,
    ) -> UploadOutcome {
        let size = content.len() as u64;
        let attempts = AtomicU32::new(0);
        let result = tokio::time::timeout(
            deadline,
            self.put_with_retry(key, content, metadata, &attempts),
        )
        .await
        .unwrap_or_else(|_| {
            Err(StoreError::Transient(format!(
                "upload timed out after {}ms",
                deadline.as_millis()
            )))
        });
        self.settle(result, attempts.load(Ordering::Relaxed), size)
    }

    async fn put_with_retry(
        &self,
        key: &str,
        content: Bytes,
        metadata: &ObjectMetadata,
        attempts: &AtomicU32,
    ) -> Result<(), StoreError> {
        RetryIf::start(
            self.policy.delays(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt > 1 {
                    debug!(attempt, "retrying upload");
                }
                self.backend.put(key, content.clone(), metadata)
            },
            |err: &StoreError| {
                if err.is_retryable() {
                    warn!(error = %err, "upload attempt failed");
                }
                err.is_retryable()
            },
        )
        .await
    }

    /// Fold one finished upload into the lifetime counters.
    fn settle(&self, result: Result<(), StoreError>, attempts: u32, size: u64) -> UploadOutcome {
        match result {
            Ok(()) => {
                self.total_uploaded.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
                UploadOutcome {
                    success: true,
                    attempts,
                    bytes_written: size,
                    error: None,
                }
            }
            Err(err) => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                warn!(attempts, error = %err, "upload failed");
                UploadOutcome {
                    success: false,
                    attempts,
                    bytes_written: 0,
                    error: Some(err),
                }
            }
        }
    }

    pub fn totals(&self) -> UploadTotals {
        UploadTotals {
            total_uploaded: self.total_uploaded.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Reachability check delegated to the backend.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Backend that fails the first `failures` puts with `error`.
    struct FlakyBackend {
        failures: u32,
        error: StoreError,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectBackend for FlakyBackend {
        async fn put(&self, _: &str, _: Bytes, _: &ObjectMetadata) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            Ok(None)
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list(&self, _: Option<&str>) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn metadata() -> ObjectMetadata {
        ObjectMetadata {
            org: "org".into(),
            name: "repo".into(),
            url: "https://github.com/org/repo".into(),
            change_marker: "2025-01-01T00:00:00Z".into(),
            processed_at: chrono::Utc::now(),
            size: 5,
            content_hash: "abc".into(),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 5, 5]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn single_attempt_policy_never_sleeps() {
        assert_eq!(fast_policy(1).delays().count(), 0);
    }

    #[test]
    fn policy_from_default_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let backend = Arc::new(FlakyBackend::new(2, StoreError::Transient("503".into())));
        let client = UploadClient::new(backend.clone(), fast_policy(3));

        let outcome = client.upload("org/repo/abc", Bytes::from("hello"), &metadata()).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.bytes_written, 5);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let backend = Arc::new(FlakyBackend::new(u32::MAX, StoreError::Transient("503".into())));
        let client = UploadClient::new(backend.clone(), fast_policy(3));

        let outcome = client.upload("org/repo/abc", Bytes::from("hello"), &metadata()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(outcome.error.unwrap().is_retryable());
    }

    #[tokio::test]
    async fn rejected_is_not_retried() {
        let backend = Arc::new(FlakyBackend::new(u32::MAX, StoreError::Rejected("bad key".into())));
        let client = UploadClient::new(backend.clone(), fast_policy(5));

        let outcome = client.upload("org/repo/abc", Bytes::from("hello"), &metadata()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn totals_accumulate_across_uploads() {
        let backend = Arc::new(FlakyBackend::new(3, StoreError::Transient("503".into())));
        let client = UploadClient::new(backend, fast_policy(3));

        // Three failing calls exhaust the first upload.
        let first = client.upload("a/b/1", Bytes::from("12345"), &metadata()).await;
        let second = client.upload("a/b/2", Bytes::from("1234567890"), &metadata()).await;
        assert!(!first.success);
        assert!(second.success);

        let totals = client.totals();
        assert_eq!(totals.total_uploaded, 1);
        assert_eq!(totals.total_failed, 1);
        assert_eq!(totals.total_bytes, 10);
        assert!((totals.success_rate() - 50.0).abs() < f64::EPSILON);
        assert_eq!(totals.to_json()["totalUploaded"], 1);
    }

    #[tokio::test]
    async fn concurrent_uploads_are_counted_once_each() {
        let backend = Arc::new(FlakyBackend::new(0, StoreError::Transient("unused".into())));
        let client = Arc::new(UploadClient::new(backend, fast_policy(3)));

        let mut handles = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .upload(&format!("org/repo/{i}"), Bytes::from("xy"), &metadata())
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert_eq!(client.totals().total_uploaded, 20);
        assert_eq!(client.totals().total_bytes, 40);
    }

    /// Backend whose writes never complete.
    struct StalledBackend;

    #[async_trait]
    impl ObjectBackend for StalledBackend {
        async fn put(&self, _: &str, _: Bytes, _: &ObjectMetadata) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            Ok(None)
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list(&self, _: Option<&str>) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn expired_deadline_counts_as_failed_upload() {
        let client = UploadClient::new(Arc::new(StalledBackend), fast_policy(3));

        let outcome = client
            .upload_within("org/repo/abc", Bytes::from("hello"), &metadata(), Duration::from_millis(50))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.unwrap().to_string().contains("timed out"));
        assert_eq!(client.totals().total_failed, 1);
        assert_eq!(client.totals().total_uploaded, 0);
    }

    #[tokio::test]
    async fn deadline_does_not_affect_fast_uploads() {
        let backend = Arc::new(FlakyBackend::new(1, StoreError::Transient("503".into())));
        let client = UploadClient::new(backend, fast_policy(3));

        let outcome = client
            .upload_within("org/repo/abc", Bytes::from("hello"), &metadata(), Duration::from_secs(5))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }
}
