use std::time::Duration;
use tokio::time::Instant;

/// Contents removed from a [`RecordBuffer`] by [`RecordBuffer::drain_all`].
#[derive(Debug)]
pub struct Drained<R> {
    pub records: Vec<R>,
    pub bytes: u64,
}

impl<R> Drained<R> {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Append-only accumulation of pending records for one destination.
///
/// The buffer itself is not synchronized; the controller keeps each one
/// behind a mutex so `append` and `drain_all` never interleave.
#[derive(Debug)]
pub struct RecordBuffer<R> {
    records: Vec<R>,
    bytes: u64,
    last_flush: Instant,
}

impl<R> RecordBuffer<R> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            bytes: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn append(&mut self, record: R, size: usize) {
        self.records.push(record);
        self.bytes = self.bytes.saturating_add(size as u64);
    }

    /// Take every buffered record and reset counters and the flush timer.
    ///
    /// The timer is reset even when the buffer was empty.
    pub fn drain_all(&mut self) -> Drained<R> {
        let capacity = self.records.capacity();
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(capacity));
        let bytes = std::mem::take(&mut self.bytes);
        self.last_flush = Instant::now();
        Drained { records, bytes }
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes
    }

    pub fn age_since_last_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R> Default for RecordBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}
