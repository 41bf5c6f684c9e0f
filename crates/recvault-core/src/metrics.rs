//! Global atomic counters for recvault observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    backups_succeeded: AtomicU64,
    backups_failed: AtomicU64,
    records_written: AtomicU64,
    media_files_copied: AtomicU64,
    uploads_ingested: AtomicU64,
    restores_executed: AtomicU64,
    alerts_raised: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            backups_succeeded: AtomicU64::new(0),
            backups_failed: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            media_files_copied: AtomicU64::new(0),
            uploads_ingested: AtomicU64::new(0),
            restores_executed: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
        }
    }

    pub fn inc_backups_succeeded(&self) {
        self.backups_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backups_succeeded", "counter incremented");
    }

    pub fn inc_backups_failed(&self) {
        self.backups_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backups_failed", "counter incremented");
    }

    pub fn add_records_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_media_files_copied(&self, n: u64) {
        self.media_files_copied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_uploads_ingested(&self) {
        self.uploads_ingested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "uploads_ingested", "counter incremented");
    }

    pub fn inc_restores_executed(&self) {
        self.restores_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "restores_executed", "counter incremented");
    }

    pub fn add_alerts_raised(&self, n: u64) {
        self.alerts_raised.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            backups_succeeded = self.backups_succeeded(),
            backups_failed = self.backups_failed(),
            records_written = self.records_written(),
            media_files_copied = self.media_files_copied(),
            uploads_ingested = self.uploads_ingested(),
            restores_executed = self.restores_executed(),
            alerts_raised = self.alerts_raised(),
        );
    }

    pub fn backups_succeeded(&self) -> u64 {
        self.backups_succeeded.load(Ordering::Relaxed)
    }

    pub fn backups_failed(&self) -> u64 {
        self.backups_failed.load(Ordering::Relaxed)
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn media_files_copied(&self) -> u64 {
        self.media_files_copied.load(Ordering::Relaxed)
    }

    pub fn uploads_ingested(&self) -> u64 {
        self.uploads_ingested.load(Ordering::Relaxed)
    }

    pub fn restores_executed(&self) -> u64 {
        self.restores_executed.load(Ordering::Relaxed)
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.backups_succeeded.store(0, Ordering::Relaxed);
        self.backups_failed.store(0, Ordering::Relaxed);
        self.records_written.store(0, Ordering::Relaxed);
        self.media_files_copied.store(0, Ordering::Relaxed);
        self.uploads_ingested.store(0, Ordering::Relaxed);
        self.restores_executed.store(0, Ordering::Relaxed);
        self.alerts_raised.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.backups_succeeded(), 0);
        m.inc_backups_succeeded();
        m.inc_backups_succeeded();
        assert_eq!(m.backups_succeeded(), 2);

        m.add_records_written(1500);
        assert_eq!(m.records_written(), 1500);

        m.inc_backups_failed();
        m.inc_restores_executed();
        assert_eq!(m.backups_failed(), 1);
        assert_eq!(m.restores_executed(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_backups_succeeded();
        m.add_media_files_copied(4);
        m.inc_uploads_ingested();
        m.add_alerts_raised(2);
        m.reset();
        assert_eq!(m.backups_succeeded(), 0);
        assert_eq!(m.media_files_copied(), 0);
        assert_eq!(m.uploads_ingested(), 0);
        assert_eq!(m.alerts_raised(), 0);
    }
}
