use crate::buffer::{Drained, RecordBuffer};
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::executor::{FlushAttempt, FlushExecutor};
use crate::label::LabelGenerator;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::record::{Destination, Record};
use crate::retry::{FlushReport, RetryController};
use crate::transaction::{TransactionCoordinator, TransactionState};
use crate::transport::{PreparedLoad, Transport};
use crate::trigger::{self, BatchThresholds, FlushTrigger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Buffers records per destination and flushes them to the endpoint when
/// a row, byte or age limit is reached.
///
/// Size-triggered and timer-triggered flushes run in background tasks, at
/// most one per destination; a trigger that fires while that flush is
/// still running is coalesced and the new records wait for the next
/// evaluation. [`flush`](Self::flush), [`flush_all`](Self::flush_all) and
/// [`close`](Self::close) wait for every in-flight flush, including its
/// retries, before returning, so the engine can use them as checkpoint
/// barriers.
///
/// A terminal failure of a background flush is returned by the next
/// lifecycle call; afterwards the controller is unusable and every call
/// returns [`SinkError::Poisoned`].
pub struct BatchFlushController {
    shared: Arc<Shared>,
    ticker_stop: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: SinkConfig,
    thresholds: BatchThresholds,
    executor: FlushExecutor,
    retry: RetryController,
    labels: LabelGenerator,
    metrics: Arc<SinkMetrics>,
    slots: Mutex<HashMap<Destination, Arc<Slot>>>,
    txn: Mutex<TransactionCoordinator>,
    health: Mutex<Health>,
    /// Background failures that arrived after the sink had already failed.
    late_failures: Mutex<Vec<SinkError>>,
    /// Cancels backoff sleeps and in-flight submissions on shutdown.
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Per-destination state.
struct Slot {
    destination: Destination,
    buffer: Mutex<RecordBuffer<Vec<u8>>>,
    /// Held for the whole life of a flush, retries included.
    flushing: Arc<tokio::sync::Mutex<()>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

enum Health {
    Ok,
    /// A background flush failed and nobody has seen the error yet.
    Failed(SinkError),
    /// The failure was already returned to a caller.
    Reported(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BatchFlushController {
    /// Validate `config`, start the interval timer and return a ready controller.
    pub async fn open(config: SinkConfig, transport: Arc<dyn Transport>) -> Result<Self, SinkError> {
        let config = config.validated()?;
        let metrics = Arc::new(SinkMetrics::default());
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            thresholds: config.thresholds(),
            executor: FlushExecutor::new(transport, &config),
            retry: RetryController::new(config.retry_policy(), cancel.clone(), Arc::clone(&metrics)),
            labels: LabelGenerator::new(config.label_prefix.clone(), config.writer_id),
            metrics,
            slots: Mutex::new(HashMap::new()),
            txn: Mutex::new(TransactionCoordinator::new()),
            health: Mutex::new(Health::Ok),
            late_failures: Mutex::new(Vec::new()),
            cancel,
            closed: AtomicBool::new(false),
            config,
        });

        let ticker_stop = CancellationToken::new();
        let ticker = spawn_ticker(Arc::clone(&shared), ticker_stop.clone());

        tracing::info!(
            nodes = ?shared.config.node_urls,
            database = %shared.config.database,
            table = %shared.config.table,
            writer_id = shared.config.writer_id,
            format = %shared.config.format,
            max_rows = shared.thresholds.max_rows,
            max_bytes = shared.thresholds.max_bytes,
            interval_ms = shared.thresholds.max_interval.as_millis() as u64,
            two_phase_commit = shared.config.two_phase_commit,
            "stream load sink opened"
        );

        Ok(Self {
            shared,
            ticker_stop,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Open a controller backed by the HTTP stream load transport.
    #[cfg(feature = "stream-load")]
    pub async fn open_stream_load(config: SinkConfig) -> Result<Self, SinkError> {
        let config = config.validated()?;
        let transport = crate::stream_load::StreamLoadTransport::new(&config)?;
        Self::open(config, Arc::new(transport)).await
    }

    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    /// Destination named by the configuration's database and table.
    pub fn default_destination(&self) -> Destination {
        self.shared.config.default_destination()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Rows currently buffered for `destination`, not counting in-flight batches.
    pub fn buffered_rows(&self, destination: &Destination) -> usize {
        let slot = lock(&self.shared.slots).get(destination).cloned();
        slot.map(|s| lock(&s.buffer).row_count()).unwrap_or(0)
    }

    /// Buffer one record and start a background flush if a size limit is hit.
    ///
    /// Never waits for a flush. Returns the error of an earlier background
    /// flush if one failed since the last call.
    pub async fn write(&self, destination: &Destination, record: &Record) -> Result<(), SinkError> {
        self.ensure_open()?;
        self.shared.check_health()?;
        if self.shared.config.two_phase_commit && lock(&self.shared.txn).open_checkpoint().is_none() {
            return Err(SinkError::Transaction(
                "write outside of an open transaction".to_string(),
            ));
        }

        let row = self.shared.executor.serialize(record)?;
        let size = row.len();
        let slot = self.shared.slot(destination);

        let fired = {
            let mut buffer = lock(&slot.buffer);
            buffer.append(row, size);
            trigger::evaluate(
                buffer.row_count(),
                buffer.byte_size(),
                buffer.age_since_last_flush(),
                &self.shared.thresholds,
            )
        };
        self.shared.metrics.record_write(size);

        match fired {
            Some(FlushTrigger::Interval) | None => Ok(()),
            Some(reason) => self.shared.launch(&slot, reason),
        }
    }

    /// Flush `destination` now, regardless of limits.
    ///
    /// Waits for any in-flight flush of the destination first, then drains
    /// and submits whatever is buffered. Returns `None` when there was
    /// nothing to send.
    pub async fn flush(&self, destination: &Destination) -> Result<Option<FlushReport>, SinkError> {
        self.ensure_open()?;
        let slot = lock(&self.shared.slots).get(destination).cloned();
        match slot {
            Some(slot) => self.shared.flush_slot(&slot).await,
            None => self.shared.check_health().map(|_| None),
        }
    }

    /// Flush every destination; see [`flush`](Self::flush).
    pub async fn flush_all(&self) -> Result<Vec<FlushReport>, SinkError> {
        self.ensure_open()?;
        self.shared.flush_all().await
    }

    /// Flush everything that is buffered, wait for in-flight flushes and
    /// release the buffers. Later calls fail with [`SinkError::Closed`].
    ///
    /// Every destination is attempted even when another one fails. On error
    /// the returned [`SinkError`] covers every row that is not confirmed
    /// delivered, see [`SinkError::undelivered_rows`]; when more than one
    /// destination failed it is [`SinkError::Incomplete`]. Rows that were
    /// never submitted, because the sink had already failed or no
    /// transaction was open, are reported as [`SinkError::Unflushed`].
    pub async fn close(&self) -> Result<Vec<FlushReport>, SinkError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.stop_ticker().await;

        let result = self.shared.flush_every_slot(true).await;
        lock(&self.shared.slots).clear();
        match &result {
            Ok(reports) => tracing::info!(final_flushes = reports.len(), "stream load sink closed"),
            Err(e) => tracing::error!(
                undelivered_rows = e.undelivered_rows(),
                error = %e,
                "stream load sink closed with failed final flushes"
            ),
        }
        result
    }

    /// Stop without flushing.
    ///
    /// Pending backoff sleeps and in-flight submissions are cancelled; a
    /// batch interrupted that way is reported as
    /// [`SinkError::UnknownOutcome`]. Records still buffered are discarded
    /// and their count is returned.
    pub async fn shutdown(&self) -> Result<usize, SinkError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.stop_ticker().await;
        self.shared.cancel.cancel();

        let mut discarded = 0;
        for slot in self.shared.snapshot_slots() {
            self.shared.wait_in_flight(&slot).await?;
            discarded += lock(&slot.buffer).drain_all().len();
        }
        lock(&self.shared.slots).clear();

        if discarded > 0 {
            tracing::warn!(rows = discarded, "discarded buffered rows on shutdown");
        }
        self.shared.check_health()?;
        Ok(discarded)
    }

    /// Start a transaction for `checkpoint_id`. Requires `two_phase_commit`.
    pub fn begin_transaction(&self, checkpoint_id: u64) -> Result<(), SinkError> {
        self.ensure_open()?;
        self.ensure_two_phase()?;
        lock(&self.shared.txn).begin(checkpoint_id)?;
        tracing::debug!(checkpoint = checkpoint_id, "transaction started");
        Ok(())
    }

    /// Flush everything under the open transaction and return the
    /// prepared loads the engine must later commit or abort.
    pub async fn pre_commit(&self) -> Result<Vec<PreparedLoad>, SinkError> {
        self.ensure_open()?;
        self.ensure_two_phase()?;
        let state = lock(&self.shared.txn).state();
        if !matches!(state, TransactionState::Open { .. }) {
            return Err(SinkError::Transaction(format!(
                "cannot pre_commit while transaction is {:?}",
                state
            )));
        }

        self.shared.flush_all().await?;
        let prepared = lock(&self.shared.txn).pre_commit()?;
        tracing::debug!(loads = prepared.len(), "transaction pre-committed");
        Ok(prepared)
    }

    /// Commit prepared loads, either from the last `pre_commit` or restored
    /// by the engine after a restart.
    pub async fn commit(&self, loads: &[PreparedLoad]) -> Result<(), SinkError> {
        self.ensure_two_phase()?;
        let checkpoint = lock(&self.shared.txn).begin_commit()?;

        for load in loads {
            self.shared
                .executor
                .transport()
                .commit(load)
                .await
                .map_err(|e| {
                    SinkError::Transaction(format!(
                        "commit of txn {} ({}) failed: {}",
                        load.txn_id, load.label, e
                    ))
                })?;
        }
        lock(&self.shared.txn).finish();
        tracing::debug!(checkpoint = ?checkpoint, loads = loads.len(), "transaction committed");
        Ok(())
    }

    /// Abort `loads` plus every load prepared in the current transaction,
    /// discarding records buffered for it.
    pub async fn abort(&self, loads: &[PreparedLoad]) -> Result<(), SinkError> {
        self.ensure_two_phase()?;

        let mut discarded = 0;
        for slot in self.shared.snapshot_slots() {
            self.shared.wait_in_flight(&slot).await?;
            discarded += lock(&slot.buffer).drain_all().len();
        }

        let mut pending = lock(&self.shared.txn).begin_abort();
        for load in loads {
            if !pending.iter().any(|p| p.txn_id == load.txn_id) {
                pending.push(load.clone());
            }
        }

        let mut first_err = None;
        for load in &pending {
            if let Err(e) = self.shared.executor.transport().abort(load).await {
                tracing::error!(txn_id = load.txn_id, label = %load.label, error = %e, "abort failed");
                first_err.get_or_insert_with(|| {
                    SinkError::Transaction(format!("abort of txn {} ({}) failed: {}", load.txn_id, load.label, e))
                });
            }
        }
        lock(&self.shared.txn).finish();
        tracing::debug!(loads = pending.len(), discarded_rows = discarded, "transaction aborted");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), SinkError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(SinkError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_two_phase(&self) -> Result<(), SinkError> {
        if self.shared.config.two_phase_commit {
            Ok(())
        } else {
            Err(SinkError::Transaction("two-phase commit is not enabled".to_string()))
        }
    }

    async fn stop_ticker(&self) {
        self.ticker_stop.cancel();
        let handle = lock(&self.ticker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "flush timer task ended abnormally");
            }
        }
    }
}

impl Drop for BatchFlushController {
    fn drop(&mut self) {
        self.ticker_stop.cancel();
    }
}

impl Shared {
    fn slot(&self, destination: &Destination) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(destination) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot {
            destination: destination.clone(),
            buffer: Mutex::new(RecordBuffer::with_capacity(self.thresholds.max_rows.min(4096))),
            flushing: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: Mutex::new(None),
        });
        slots.insert(destination.clone(), Arc::clone(&slot));
        tracing::debug!(destination = %destination, "created buffer");
        slot
    }

    fn snapshot_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots: Vec<Arc<Slot>> = lock(&self.slots).values().cloned().collect();
        slots.sort_by(|a, b| a.destination.cmp(&b.destination));
        slots
    }

    /// Take the background failures nobody has seen yet.
    fn take_parked(&self) -> Vec<SinkError> {
        let mut taken = Vec::new();
        {
            let mut health = lock(&self.health);
            match std::mem::replace(&mut *health, Health::Ok) {
                Health::Failed(err) => {
                    *health = Health::Reported(err.to_string());
                    taken.push(err);
                }
                other => *health = other,
            }
        }
        taken.append(&mut lock(&self.late_failures));
        taken
    }

    /// Return a parked background failure once, then `Poisoned` forever.
    fn check_health(&self) -> Result<(), SinkError> {
        let mut health = lock(&self.health);
        match std::mem::replace(&mut *health, Health::Ok) {
            Health::Ok => Ok(()),
            Health::Failed(err) => {
                *health = Health::Reported(err.to_string());
                Err(err)
            }
            Health::Reported(reason) => {
                *health = Health::Reported(reason.clone());
                Err(SinkError::Poisoned(reason))
            }
        }
    }

    /// Park a background failure for the next caller.
    fn park(&self, err: SinkError) {
        let mut health = lock(&self.health);
        if matches!(*health, Health::Ok) {
            *health = Health::Failed(err);
        } else {
            tracing::error!(error = %err, "additional flush failure after the sink already failed");
            lock(&self.late_failures).push(err);
        }
    }

    /// Mark the controller failed with an error already returned to the caller.
    fn poison(&self, err: &SinkError) {
        let mut health = lock(&self.health);
        if matches!(*health, Health::Ok) {
            *health = Health::Reported(err.to_string());
        }
    }

    fn checkpoint(&self) -> Result<Option<u64>, SinkError> {
        if !self.config.two_phase_commit {
            return Ok(None);
        }
        lock(&self.txn)
            .open_checkpoint()
            .map(Some)
            .ok_or_else(|| SinkError::Transaction("flush outside of an open transaction".to_string()))
    }

    fn attempt(
        &self,
        slot: &Slot,
        drained: Drained<Vec<u8>>,
        trigger: FlushTrigger,
        checkpoint: Option<u64>,
    ) -> FlushAttempt {
        let label = self.labels.next(&slot.destination, checkpoint);
        self.executor.prepare(
            slot.destination.clone(),
            label,
            drained.records,
            drained.bytes,
            trigger,
            checkpoint,
        )
    }

    fn record_prepared(&self, report: &FlushReport) {
        if !self.config.two_phase_commit {
            return;
        }
        let Some(txn_id) = report.txn_id else {
            tracing::warn!(label = %report.label, "prepared load has no transaction id, it cannot be committed");
            return;
        };
        let load = PreparedLoad {
            destination: report.destination.clone(),
            label: report.label.clone(),
            txn_id,
        };
        if let Err(e) = lock(&self.txn).record(load) {
            self.park(e);
        }
    }

    /// Start a background flush unless one is already running for the slot.
    fn launch(self: &Arc<Self>, slot: &Arc<Slot>, reason: FlushTrigger) -> Result<(), SinkError> {
        let guard = match Arc::clone(&slot.flushing).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics.record_coalesced();
                tracing::trace!(destination = %slot.destination, trigger = reason.as_str(), "flush already running, coalescing trigger");
                return Ok(());
            }
        };

        let checkpoint = self.checkpoint()?;
        let drained = lock(&slot.buffer).drain_all();
        if drained.is_empty() {
            return Ok(());
        }
        let attempt = self.attempt(slot, drained, reason, checkpoint);
        tracing::debug!(
            destination = %slot.destination,
            label = %attempt.label,
            rows = attempt.rows,
            trigger = reason.as_str(),
            "starting background flush"
        );

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match shared.retry.run(&shared.executor, attempt).await {
                Ok(report) => shared.record_prepared(&report),
                Err(e) => shared.park(e),
            }
        });
        *lock(&slot.in_flight) = Some(handle);
        Ok(())
    }

    /// Wait until no flush is running for the slot and surface a panic of
    /// the last background flush.
    async fn wait_in_flight<'a>(
        &self,
        slot: &'a Slot,
    ) -> Result<tokio::sync::MutexGuard<'a, ()>, SinkError> {
        let guard = slot.flushing.lock().await;
        let handle = lock(&slot.in_flight).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                let err = SinkError::from(e);
                self.poison(&err);
                return Err(err);
            }
        }
        Ok(guard)
    }

    async fn flush_slot(&self, slot: &Slot) -> Result<Option<FlushReport>, SinkError> {
        let _guard = self.wait_in_flight(slot).await?;
        self.check_health()?;
        self.submit_buffered(slot).await
    }

    /// Drain and submit whatever the slot holds. The caller holds its flush lock.
    async fn submit_buffered(&self, slot: &Slot) -> Result<Option<FlushReport>, SinkError> {
        if lock(&slot.buffer).is_empty() {
            return Ok(None);
        }

        let checkpoint = self.checkpoint()?;
        let drained = lock(&slot.buffer).drain_all();
        let attempt = self.attempt(slot, drained, FlushTrigger::Explicit, checkpoint);
        match self.retry.run(&self.executor, attempt).await {
            Ok(report) => {
                self.record_prepared(&report);
                Ok(Some(report))
            }
            Err(e) => {
                self.poison(&e);
                Err(e)
            }
        }
    }

    async fn flush_all(&self) -> Result<Vec<FlushReport>, SinkError> {
        self.flush_every_slot(false).await
    }

    /// Flush every destination, going on after a destination fails, and
    /// return all failures together.
    ///
    /// When `closing`, a sink that failed earlier submits nothing, and rows
    /// that could not be submitted are drained and reported as
    /// [`SinkError::Unflushed`], so no buffered row is dropped unreported.
    async fn flush_every_slot(&self, closing: bool) -> Result<Vec<FlushReport>, SinkError> {
        let mut failures = Vec::new();
        let submit = match self.check_health() {
            Ok(()) => true,
            Err(e) if closing => {
                failures.push(e);
                false
            }
            Err(e) => return Err(e),
        };

        let mut reports = Vec::new();
        for slot in self.snapshot_slots() {
            let guard = match self.wait_in_flight(&slot).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    failures.push(e);
                    None
                }
            };
            failures.extend(self.take_parked());
            if submit && guard.is_some() {
                match self.submit_buffered(&slot).await {
                    Ok(Some(report)) => reports.push(report),
                    Ok(None) => {}
                    Err(e) => failures.push(e),
                }
            }
            if closing {
                failures.extend(drain_unflushed(&slot));
            }
        }
        failures.extend(self.take_parked());

        match SinkError::from_failures(failures) {
            None => Ok(reports),
            Some(err) => {
                tracing::error!(
                    delivered = reports.len(),
                    undelivered_rows = err.undelivered_rows(),
                    error = %err,
                    "flush of every destination failed"
                );
                Err(err)
            }
        }
    }

    /// Timer pass: launch interval flushes for buffers that are old enough.
    fn tick(self: &Arc<Self>) {
        for slot in self.snapshot_slots() {
            let fired = {
                let buffer = lock(&slot.buffer);
                trigger::evaluate(
                    buffer.row_count(),
                    buffer.byte_size(),
                    buffer.age_since_last_flush(),
                    &self.thresholds,
                )
            };
            if let Some(reason) = fired {
                if let Err(e) = self.launch(&slot, reason) {
                    self.park(e);
                }
            }
        }
    }
}

/// Drop what is left in the slot, as an error naming the rows.
fn drain_unflushed(slot: &Slot) -> Option<SinkError> {
    let rows = lock(&slot.buffer).drain_all().len();
    (rows > 0).then(|| SinkError::Unflushed {
        destination: slot.destination.clone(),
        rows,
    })
}

fn spawn_ticker(shared: Arc<Shared>, stop: CancellationToken) -> JoinHandle<()> {
    let period = shared.thresholds.tick_period();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => shared.tick(),
            }
        }
        tracing::trace!("flush timer stopped");
    })
}
