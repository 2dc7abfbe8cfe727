use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the controller and its flush tasks.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Records accepted by `write`.
    pub records_written: AtomicU64,
    /// Serialized bytes accepted by `write`.
    pub bytes_written: AtomicU64,
    /// Batches confirmed by the endpoint.
    pub flushes: AtomicU64,
    /// Rows in confirmed batches.
    pub rows_flushed: AtomicU64,
    /// Re-submissions after a retryable failure.
    pub retries: AtomicU64,
    /// Batches that ended in a terminal failure.
    pub failures: AtomicU64,
    /// Triggers that fired while a flush for the same destination was running.
    pub coalesced_triggers: AtomicU64,
}

impl SinkMetrics {
    #[inline]
    pub fn record_write(&self, bytes: usize) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_flush(&self, rows: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed.fetch_add(rows as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_coalesced(&self) {
        self.coalesced_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            coalesced_triggers: self.coalesced_triggers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SinkMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_written: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub rows_flushed: u64,
    pub retries: u64,
    pub failures: u64,
    pub coalesced_triggers: u64,
}
