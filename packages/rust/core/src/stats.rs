//! Per-run statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RunStatistics (snapshot)
// ---------------------------------------------------------------------------

/// Counters describing one completed (or planned) run.
///
/// Accounting identities, checked by [`RunStatistics::is_consistent`]:
/// - `cache_hits + cache_misses + validation_errors + cancelled == total_items`
/// - `cache_misses == processed + generation_errors + upload_errors + cache_write_errors`
/// - `errors` is the sum of the four error kinds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub total_items: u64,
    pub processed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uploads: u64,
    pub errors: u64,
    pub validation_errors: u64,
    pub generation_errors: u64,
    pub upload_errors: u64,
    pub cache_write_errors: u64,
    /// Items never started because the run was cancelled.
    pub cancelled: u64,
    pub bytes_uploaded: u64,
    #[serde(with = "duration_millis", rename = "elapsedMs")]
    pub elapsed: Duration,
}

impl RunStatistics {
    pub fn is_consistent(&self) -> bool {
        self.cache_hits + self.cache_misses + self.validation_errors + self.cancelled
            == self.total_items
            && self.cache_misses
                == self.processed
                    + self.generation_errors
                    + self.upload_errors
                    + self.cache_write_errors
            && self.errors
                == self.validation_errors
                    + self.generation_errors
                    + self.upload_errors
                    + self.cache_write_errors
    }

    /// Share of items skipped by the cache, as a percentage.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_items as f64 * 100.0
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// StatsAggregator (live counters)
// ---------------------------------------------------------------------------

/// Lock-free counters shared by the workers of a single run.
#[derive(Debug, Default)]
pub(crate) struct StatsAggregator {
    total_items: AtomicU64,
    processed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    uploads: AtomicU64,
    validation_errors: AtomicU64,
    generation_errors: AtomicU64,
    upload_errors: AtomicU64,
    cache_write_errors: AtomicU64,
    cancelled: AtomicU64,
    bytes_uploaded: AtomicU64,
    completed: AtomicU64,
}

impl StatsAggregator {
    pub fn new(total_items: u64) -> Self {
        let stats = Self::default();
        stats.total_items.store(total_items, Ordering::Relaxed);
        stats
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_error(&self) {
        self.generation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_error(&self) {
        self.upload_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploaded(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_write_error(&self) {
        self.cache_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one item terminal; returns the number completed so far.
    pub fn complete(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self, elapsed: Duration) -> RunStatistics {
        let validation_errors = self.validation_errors.load(Ordering::Relaxed);
        let generation_errors = self.generation_errors.load(Ordering::Relaxed);
        let upload_errors = self.upload_errors.load(Ordering::Relaxed);
        let cache_write_errors = self.cache_write_errors.load(Ordering::Relaxed);

        RunStatistics {
            total_items: self.total_items.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            errors: validation_errors + generation_errors + upload_errors + cache_write_errors,
            validation_errors,
            generation_errors,
            upload_errors,
            cache_write_errors,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_errors() {
        let agg = StatsAggregator::new(5);
        agg.validation_error();
        agg.cache_miss();
        agg.generation_error();
        agg.cache_miss();
        agg.uploaded(10);
        agg.cache_write_error();
        agg.cache_hit();
        agg.cancelled();

        let stats = agg.snapshot(Duration::from_secs(1));
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.uploads, 1);
        assert_eq!(stats.processed, 0);
        assert!(stats.is_consistent());
    }

    #[test]
    fn inconsistent_counts_are_detected() {
        let stats = RunStatistics {
            total_items: 2,
            cache_hits: 1,
            ..Default::default()
        };
        assert!(!stats.is_consistent());
    }

    #[test]
    fn serializes_camel_case_with_millis() {
        let stats = RunStatistics {
            total_items: 4,
            cache_hits: 4,
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalItems"], 4);
        assert_eq!(json["elapsedMs"], 1500);

        let back: RunStatistics = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
        assert!((back.cache_hit_rate() - 100.0).abs() < f64::EPSILON);
    }
}
