use std::time::Duration;

pub const DEFAULT_BATCH_MAX_ROWS: usize = 1024;
pub const DEFAULT_BATCH_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Finest resolution the interval timer is allowed to run at.
pub const MIN_TICK: Duration = Duration::from_millis(10);

/// Limits that force a buffer to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchThresholds {
    pub max_rows: usize,
    pub max_bytes: u64,
    pub max_interval: Duration,
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_BATCH_MAX_ROWS,
            max_bytes: DEFAULT_BATCH_MAX_BYTES,
            max_interval: DEFAULT_BATCH_INTERVAL,
        }
    }
}

impl BatchThresholds {
    /// Period of the background timer. A tenth of the interval keeps the
    /// worst-case flush latency within 110% of `max_interval`.
    pub fn tick_period(&self) -> Duration {
        (self.max_interval / 10).max(MIN_TICK).min(self.max_interval)
    }
}

/// Which limit caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Rows,
    Bytes,
    Interval,
    /// Requested by the caller (`flush`, `close`, checkpoint).
    Explicit,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Rows => "rows",
            FlushTrigger::Bytes => "bytes",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Explicit => "explicit",
        }
    }
}

/// Decide whether a buffer in the given state must be flushed now.
///
/// Size limits take precedence over the interval in the returned reason.
/// An empty buffer never triggers.
pub fn evaluate(
    rows: usize,
    bytes: u64,
    age: Duration,
    thresholds: &BatchThresholds,
) -> Option<FlushTrigger> {
    if rows == 0 {
        return None;
    }
    if rows >= thresholds.max_rows {
        Some(FlushTrigger::Rows)
    } else if bytes >= thresholds.max_bytes {
        Some(FlushTrigger::Bytes)
    } else if age >= thresholds.max_interval {
        Some(FlushTrigger::Interval)
    } else {
        None
    }
}
