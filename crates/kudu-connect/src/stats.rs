//! Task statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pool::PoolStats;
use crate::retry::BatchOutcome;

/// Point-in-time task statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    /// Records handed to `put`
    pub records_received: u64,
    /// Records excluded by the table filter
    pub records_excluded: u64,
    /// Records that failed routing or translation
    pub records_failed: u64,
    /// Rows confirmed by the cluster
    pub rows_written: u64,
    /// Rows dropped under the skip policy
    pub records_dropped: u64,
    pub batches_acked: u64,
    /// Resubmissions across all batches
    pub batches_retried: u64,
    pub batches_fatal: u64,
    /// Batches cut short by shutdown
    pub batches_aborted: u64,
    pub pool: PoolStats,
}

/// Atomic task statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicTaskStats {
    pub records_received: AtomicU64,
    pub records_excluded: AtomicU64,
    pub records_failed: AtomicU64,
    pub rows_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub batches_acked: AtomicU64,
    pub batches_retried: AtomicU64,
    pub batches_fatal: AtomicU64,
    pub batches_aborted: AtomicU64,
}

impl AtomicTaskStats {
    pub fn record_received(&self, records: u64) {
        self.records_received.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_excluded(&self) {
        self.records_excluded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold in the result of a finished batch
    pub fn record_outcome(&self, outcome: &BatchOutcome) {
        self.rows_written
            .fetch_add(outcome.rows_written as u64, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(outcome.dropped.len() as u64, Ordering::Relaxed);
        self.batches_retried
            .fetch_add(u64::from(outcome.retries()), Ordering::Relaxed);

        let counter = if outcome.is_acked() {
            &self.batches_acked
        } else if outcome.is_aborted() {
            &self.batches_aborted
        } else {
            &self.batches_fatal
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.batches_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self, pool: PoolStats) -> TaskStats {
        TaskStats {
            records_received: self.records_received.load(Ordering::Relaxed),
            records_excluded: self.records_excluded.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            batches_fatal: self.batches_fatal.load(Ordering::Relaxed),
            batches_aborted: self.batches_aborted.load(Ordering::Relaxed),
            pool,
        }
    }
}
