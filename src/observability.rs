//! Observability stubs (metrics, tracing)

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    backups_completed: AtomicU64,
    backups_failed: AtomicU64,
    backup_attempts: AtomicU64,
    snapshots_pruned: AtomicU64,
    verifications_run: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_completed(&self) {
        self.backups_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "backups_completed", "Metric incremented");
    }

    pub fn backup_failed(&self) {
        self.backups_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "backups_failed", "Metric incremented");
    }

    pub fn backup_attempt(&self) {
        self.backup_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "backup_attempts", "Metric incremented");
    }

    pub fn snapshots_pruned(&self, count: u64) {
        self.snapshots_pruned.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(counter = "snapshots_pruned", count, "Metric incremented");
    }

    pub fn verification_run(&self) {
        self.verifications_run.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "verifications_run", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_completed: self.backups_completed.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            backup_attempts: self.backup_attempts.load(Ordering::Relaxed),
            snapshots_pruned: self.snapshots_pruned.load(Ordering::Relaxed),
            verifications_run: self.verifications_run.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub backups_completed: u64,
    pub backups_failed: u64,
    pub backup_attempts: u64,
    pub snapshots_pruned: u64,
    pub verifications_run: u64,
}
