use crate::error::SinkError;
use crate::executor::{FlushAttempt, FlushExecutor, FlushOutcome};
use crate::metrics::SinkMetrics;
use crate::record::Destination;
use crate::trigger::FlushTrigger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Retry parameters for flush attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first submission; `0` makes the first failure terminal.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Delay growth per retry; `1.0` gives a constant delay.
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based):
    /// `min(initial_delay * factor^(retry - 1), max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = (self.initial_delay.as_millis() as f64 * self.factor.powi(exponent)).min(max_ms);
        Duration::from_millis(ms as u64)
    }

    pub fn backoff(&self) -> BackoffState {
        BackoffState {
            policy: *self,
            retries: 0,
            current_delay: Duration::ZERO,
        }
    }
}

/// Backoff progress for one flush attempt sequence.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: RetryPolicy,
    retries: u32,
    current_delay: Duration,
}

impl BackoffState {
    /// Delay before the next retry, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        self.retries += 1;
        self.current_delay = self.policy.delay_for(self.retries);
        Some(self.current_delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

/// Lifecycle of a flush attempt inside [`RetryController::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Executing,
    RetryScheduled(Duration),
    Succeeded,
    Exhausted,
    Fatal,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::Exhausted | AttemptState::Fatal | AttemptState::Cancelled
        )
    }
}

/// Summary of a confirmed flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub destination: Destination,
    pub label: String,
    pub rows: usize,
    pub rows_written: u64,
    pub attempts: u32,
    /// Backoff delays slept between submissions, in order.
    pub delays: Vec<Duration>,
    pub trigger: FlushTrigger,
    pub txn_id: Option<i64>,
    pub deduplicated: bool,
}

/// Drives a [`FlushAttempt`] through the executor until it succeeds,
/// fails fatally, exhausts its retries, or is cancelled.
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    cancel: CancellationToken,
    metrics: Arc<SinkMetrics>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken, metrics: Arc<SinkMetrics>) -> Self {
        RetryController {
            policy,
            cancel,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the attempt to a terminal state.
    ///
    /// Every submission reuses the attempt's label and payload. Backoff
    /// sleeps only suspend this future. Cancellation interrupts both the
    /// sleep and an in-flight submission; either way the batch is
    /// reported as [`SinkError::UnknownOutcome`] since an earlier
    /// submission may have landed.
    pub async fn run(
        &self,
        executor: &FlushExecutor,
        mut attempt: FlushAttempt,
    ) -> Result<FlushReport, SinkError> {
        let mut backoff = self.policy.backoff();
        let mut delays = Vec::new();
        let mut state = AttemptState::Pending;
        tracing::trace!(label = %attempt.label, state = ?state, "flush attempt created");

        loop {
            state = AttemptState::Executing;
            attempt.attempts += 1;
            tracing::trace!(label = %attempt.label, attempt = attempt.attempts, state = ?state, "submitting batch");

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(&attempt)),
                outcome = executor.execute(&attempt) => outcome,
            };

            match outcome {
                FlushOutcome::Success {
                    rows_written,
                    txn_id,
                    deduplicated,
                } => {
                    state = AttemptState::Succeeded;
                    self.metrics.record_flush(attempt.rows);
                    tracing::debug!(
                        destination = %attempt.destination,
                        label = %attempt.label,
                        rows = attempt.rows,
                        bytes = attempt.bytes,
                        attempt = attempt.attempts,
                        trigger = attempt.trigger.as_str(),
                        deduplicated,
                        state = ?state,
                        "flushed batch"
                    );
                    return Ok(FlushReport {
                        destination: attempt.destination,
                        label: attempt.label,
                        rows: attempt.rows,
                        rows_written,
                        attempts: attempt.attempts,
                        delays,
                        trigger: attempt.trigger,
                        txn_id,
                        deduplicated,
                    });
                }
                FlushOutcome::FatalFailure(cause) => {
                    state = AttemptState::Fatal;
                    self.metrics.record_failure();
                    tracing::error!(
                        destination = %attempt.destination,
                        label = %attempt.label,
                        rows = attempt.rows,
                        attempt = attempt.attempts,
                        error = %cause,
                        state = ?state,
                        "flush failed, not retrying"
                    );
                    return Err(SinkError::Fatal {
                        destination: attempt.destination,
                        label: attempt.label,
                        rows: attempt.rows,
                        cause,
                    });
                }
                FlushOutcome::RetryableFailure(cause) => {
                    let Some(delay) = backoff.next_delay() else {
                        state = AttemptState::Exhausted;
                        self.metrics.record_failure();
                        tracing::error!(
                            destination = %attempt.destination,
                            label = %attempt.label,
                            rows = attempt.rows,
                            attempts = attempt.attempts,
                            error = %cause,
                            state = ?state,
                            "flush retries exhausted"
                        );
                        return Err(SinkError::RetryExhausted {
                            destination: attempt.destination,
                            label: attempt.label,
                            rows: attempt.rows,
                            attempts: attempt.attempts,
                            cause,
                        });
                    };

                    state = AttemptState::RetryScheduled(delay);
                    self.metrics.record_retry();
                    tracing::warn!(
                        destination = %attempt.destination,
                        label = %attempt.label,
                        attempt = attempt.attempts,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        state = ?state,
                        "flush failed, retrying"
                    );
                    delays.push(delay);

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(self.cancelled(&attempt)),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn cancelled(&self, attempt: &FlushAttempt) -> SinkError {
        self.metrics.record_failure();
        tracing::warn!(
            destination = %attempt.destination,
            label = %attempt.label,
            rows = attempt.rows,
            attempt = attempt.attempts,
            state = ?AttemptState::Cancelled,
            "flush cancelled, delivery outcome unknown"
        );
        SinkError::UnknownOutcome {
            destination: attempt.destination.clone(),
            label: attempt.label.clone(),
            rows: attempt.rows,
        }
    }
}
