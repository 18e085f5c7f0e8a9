//! Batch ingestion: validate → cache check → generate → upload → cache write.
//!
//! Every item reaches exactly one terminal [`ItemOutcome`]. Item failures are
//! recorded and never abort the batch; only an unreachable cache or object
//! store, detected before any item starts, fails the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use reposcrape_cache::ChangeMarkerCache;
use reposcrape_shared::{
    Artifact, CacheKey, ObjectMetadata, PipelineConfig, RepositoryDescriptor, ReposcrapeError,
    Result,
};
use reposcrape_store::UploadClient;

use crate::generator::ArtifactGenerator;
use crate::stats::{RunStatistics, StatsAggregator};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an item did not end up processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemFailure {
    #[error("invalid descriptor: {0}")]
    Validation(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("upload failed: {0}")]
    Upload(String),

    /// The artifact is in the store but the cache still holds the old marker.
    #[error("cache write failed after upload: {message}")]
    CacheWrite { bytes: u64, message: String },
}

/// Terminal state of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    CacheHit,
    Processed { bytes: u64 },
    Failed(ItemFailure),
    /// Never started because the run was cancelled.
    Cancelled,
}

impl ItemOutcome {
    /// Fold this outcome into the run counters.
    fn record(&self, stats: &StatsAggregator) {
        match self {
            Self::CacheHit => stats.cache_hit(),
            Self::Processed { bytes } => {
                stats.cache_miss();
                stats.uploaded(*bytes);
                stats.processed();
            }
            Self::Failed(ItemFailure::Validation(_)) => stats.validation_error(),
            Self::Failed(ItemFailure::Generation(_)) => {
                stats.cache_miss();
                stats.generation_error();
            }
            Self::Failed(ItemFailure::Upload(_)) => {
                stats.cache_miss();
                stats.upload_error();
            }
            Self::Failed(ItemFailure::CacheWrite { bytes, .. }) => {
                stats.cache_miss();
                stats.uploaded(*bytes);
                stats.cache_write_error();
            }
            Self::Cancelled => stats.cancelled(),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once per item as it reaches its terminal outcome.
    fn item_finished(&self, label: &str, outcome: &ItemOutcome, completed: u64, total: u64);
    /// Called when the run completes.
    fn done(&self, stats: &RunStatistics);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_finished(&self, _label: &str, _outcome: &ItemOutcome, _completed: u64, _total: u64) {}
    fn done(&self, _stats: &RunStatistics) {}
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// What a run would do, computed without generating, uploading or writing.
#[derive(Debug, Default)]
pub struct RunPlan {
    pub to_process: Vec<CacheKey>,
    pub cache_hits: Vec<CacheKey>,
    /// `(label, reason)` for each descriptor that failed validation.
    pub invalid: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one batch through the cache, generator and object store.
#[derive(Clone)]
pub struct Orchestrator {
    cache: Arc<dyn ChangeMarkerCache>,
    uploader: Arc<UploadClient>,
    generator: Arc<dyn ArtifactGenerator>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<dyn ChangeMarkerCache>,
        uploader: Arc<UploadClient>,
        generator: Arc<dyn ArtifactGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache,
            uploader,
            generator,
            config,
        }
    }

    pub fn uploader(&self) -> &Arc<UploadClient> {
        &self.uploader
    }

    /// Process `repos` and return the run statistics.
    ///
    /// Fails only if the cache or object store is unreachable before any
    /// item starts. Returns after every item reached a terminal outcome.
    /// Items still waiting for a worker when `cancel` fires are counted as
    /// cancelled; in-flight items run to completion.
    #[instrument(skip_all, fields(total = repos.len(), concurrency = self.config.concurrency))]
    pub async fn run(
        &self,
        repos: Vec<RepositoryDescriptor>,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunStatistics> {
        let start = Instant::now();
        let total = repos.len() as u64;

        progress.phase("Checking infrastructure");
        self.check_infrastructure().await?;

        info!(total, "starting ingestion run");
        progress.phase("Processing repositories");

        let stats = Arc::new(StatsAggregator::new(total));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for repo in repos {
            let worker = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let stats = stats.clone();

            tasks.spawn(async move {
                let label = repo.label();
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    Some(_permit) if !cancel.is_cancelled() => worker.process_item(&repo).await,
                    _ => ItemOutcome::Cancelled,
                };
                outcome.record(&stats);
                (label, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (label, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Panicked worker: counted as a generation failure.
                    error!(error = %e, "worker task failed");
                    let outcome = ItemOutcome::Failed(ItemFailure::Generation(e.to_string()));
                    outcome.record(&stats);
                    ("<unknown>".to_string(), outcome)
                }
            };
            let completed = stats.complete();
            progress.item_finished(&label, &outcome, completed, total);
            self.log_progress(&stats, completed, total, start.elapsed());
        }

        let result = stats.snapshot(start.elapsed());
        info!(
            total_items = result.total_items,
            processed = result.processed,
            cache_hits = result.cache_hits,
            cache_misses = result.cache_misses,
            uploads = result.uploads,
            errors = result.errors,
            cancelled = result.cancelled,
            bytes_uploaded = result.bytes_uploaded,
            elapsed = %format_duration(result.elapsed),
            "ingestion run complete"
        );
        debug_assert!(result.is_consistent(), "inconsistent run statistics: {result:?}");

        progress.done(&result);
        Ok(result)
    }

    /// Validate and consult the cache only. Nothing is generated, uploaded or written.
    #[instrument(skip_all, fields(total = repos.len()))]
    pub async fn plan(&self, repos: &[RepositoryDescriptor]) -> Result<RunPlan> {
        self.cache
            .ping()
            .await
            .map_err(|e| ReposcrapeError::Infrastructure(format!("cache: {e}")))?;

        let mut plan = RunPlan::default();
        for repo in repos {
            let key = match repo.validate() {
                Ok(key) => key,
                Err(e) => {
                    plan.invalid.push((repo.label(), e.to_string()));
                    continue;
                }
            };
            if self.is_cache_hit(&key, repo).await {
                plan.cache_hits.push(key);
            } else {
                plan.to_process.push(key);
            }
        }

        info!(
            to_process = plan.to_process.len(),
            cache_hits = plan.cache_hits.len(),
            invalid = plan.invalid.len(),
            "dry run planned"
        );
        Ok(plan)
    }

    async fn check_infrastructure(&self) -> Result<()> {
        self.cache
            .ping()
            .await
            .map_err(|e| ReposcrapeError::Infrastructure(format!("cache: {e}")))?;
        self.uploader
            .ping()
            .await
            .map_err(|e| ReposcrapeError::Infrastructure(format!("object store: {e}")))?;
        Ok(())
    }

    /// Stored marker equals the current one. Read failures count as a miss.
    async fn is_cache_hit(&self, key: &CacheKey, repo: &RepositoryDescriptor) -> bool {
        match self.cache.get(key).await {
            Ok(Some(stored)) => stored == repo.change_marker,
            Ok(None) => false,
            Err(e) => {
                warn!(%key, error = %e, "cache read failed, reprocessing");
                false
            }
        }
    }

    #[instrument(skip_all, fields(org = %repo.org, name = %repo.name))]
    async fn process_item(&self, repo: &RepositoryDescriptor) -> ItemOutcome {
        let key = match repo.validate() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "skipping invalid descriptor");
                return ItemOutcome::Failed(ItemFailure::Validation(e.to_string()));
            }
        };

        if self.is_cache_hit(&key, repo).await {
            debug!("cache hit");
            return ItemOutcome::CacheHit;
        }

        let content = match tokio::time::timeout(
            self.config.generation_timeout,
            self.generator.generate(repo),
        )
        .await
        {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!(error = %e, "generation failed");
                return ItemOutcome::Failed(ItemFailure::Generation(e.to_string()));
            }
            Err(_) => {
                let e = ReposcrapeError::Timeout {
                    operation: "generation",
                    after: self.config.generation_timeout,
                };
                warn!(error = %e, "generation failed");
                return ItemOutcome::Failed(ItemFailure::Generation(e.to_string()));
            }
        };

        let artifact = Artifact::new(&key, content);
        let storage_key = artifact.storage_key();
        let metadata = ObjectMetadata::for_artifact(repo, &artifact);
        let body = Bytes::from(artifact.content);

        let upload = self
            .uploader
            .upload_within(&storage_key, body, &metadata, self.config.upload_timeout)
            .await;

        if !upload.success {
            let message = upload
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown upload failure".into());
            warn!(key = %storage_key, attempts = upload.attempts, error = %message, "upload failed");
            return ItemOutcome::Failed(ItemFailure::Upload(message));
        }

        // Only a confirmed upload may advance the cache.
        if let Err(e) = self.cache.set(&key, &repo.change_marker).await {
            error!(key = %storage_key, error = %e, "cache write failed after upload");
            return ItemOutcome::Failed(ItemFailure::CacheWrite {
                bytes: upload.bytes_written,
                message: e.to_string(),
            });
        }

        debug!(key = %storage_key, bytes = upload.bytes_written, "processed");
        ItemOutcome::Processed {
            bytes: upload.bytes_written,
        }
    }

    fn log_progress(&self, stats: &StatsAggregator, completed: u64, total: u64, elapsed: Duration) {
        let interval = self.config.progress_interval as u64;
        if interval == 0 || completed % interval != 0 || completed == total {
            return;
        }
        let snapshot = stats.snapshot(elapsed);
        let percentage = completed as f64 / total as f64 * 100.0;
        let hit_rate = snapshot.cache_hits as f64 / completed as f64 * 100.0;
        let eta = elapsed.mul_f64((total - completed) as f64 / completed as f64);
        info!(
            completed,
            total,
            percentage = %format!("{percentage:.1}"),
            cache_hit_rate = %format!("{hit_rate:.1}"),
            errors = snapshot.errors,
            elapsed = %format_duration(elapsed),
            eta = %format_duration(eta),
            "progress"
        );
    }
}

/// Human-readable duration: `5h 47m`, `15m 3s`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
