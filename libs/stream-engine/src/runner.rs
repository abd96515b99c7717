use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use stream_api::computation::{Computation, ComputationContext, ComputationState};
use stream_api::log::{LogOffset, LogPartition, LogRecord};
use stream_api::{
    ComputationError, FailureKind, RebalanceListener, Record, RecordFlags, StreamError, Watermark,
};

use crate::appender::LogAppender;
use crate::context::ComputationContextImpl;
use crate::error::EngineError;
use crate::manager::LogManager;
use crate::settings::{RetryPolicy, Settings, TimerSpec};
use crate::tailer::LogTailer;
use crate::topology::{ComputationMapping, Topology};

/// Pause after a read error before reading again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A failure that stopped processing, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub computation: String,
    pub runner: String,
    /// Halted partition, `None` when the whole runner is halted.
    pub partition: Option<LogPartition>,
    pub kind: String,
    pub cause: String,
    pub at_ms: i64,
}

/// What a runner exposes to its processor.
#[derive(Debug, Default)]
pub(crate) struct RunnerStatus {
    low_watermark: AtomicI64,
    assigned: Mutex<Vec<LogPartition>>,
    terminated: AtomicBool,
}

impl RunnerStatus {
    pub(crate) fn low_watermark(&self) -> i64 {
        self.low_watermark.load(Ordering::Acquire)
    }

    pub(crate) fn assigned(&self) -> Vec<LogPartition> {
        lock(&self.assigned).clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("runner lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// State reached both by the runner loop and by the rebalance listener.
struct DriverShared {
    context: ComputationContextImpl,
    /// output slot -> appender of the mapped stream
    outputs: BTreeMap<String, LogAppender<Record>>,
    /// Records read but not yet handed to the computation.
    pending: Vec<LogRecord<Record>>,
    pending_since: Option<Instant>,
    /// First pending offset of partitions being revoked.
    revoked_offsets: HashMap<LogPartition, u64>,
}

impl DriverShared {
    /// Append buffered records in slot order. On failure, what was not
    /// appended stays buffered.
    fn flush(&mut self) -> Result<usize, StreamError> {
        let mut flushed = 0;
        for (slot, records) in self.context.records_mut() {
            let Some(appender) = self.outputs.get(slot) else {
                continue;
            };
            let mut sent = 0;
            let result = records
                .iter()
                .try_for_each(|r| appender.append(r.key(), r).map(|_| sent += 1));
            records.drain(..sent);
            flushed += sent;
            result?;
        }
        Ok(flushed)
    }
}

/// Flushes buffered output before the tailer commits and releases revoked
/// partitions.
struct DriverRebalanceListener {
    runner: String,
    shared: Arc<Mutex<DriverShared>>,
    status: Arc<RunnerStatus>,
}

impl RebalanceListener for DriverRebalanceListener {
    fn on_partitions_revoked(&self, partitions: &[LogPartition]) -> Result<(), StreamError> {
        let (flushed, dropped) = {
            let mut shared = lock(&self.shared);
            let flushed = shared.flush()?;
            let before = shared.pending.len();
            let mut revoked_offsets = HashMap::new();
            shared.pending.retain(|r| {
                let partition = r.offset().partition();
                if !partitions.contains(partition) {
                    return true;
                }
                revoked_offsets.entry(partition.clone()).or_insert(r.offset().offset());
                false
            });
            if shared.pending.is_empty() {
                shared.pending_since = None;
            }
            let dropped = before - shared.pending.len();
            shared.revoked_offsets = revoked_offsets;
            (flushed, dropped)
        };
        let mut assigned = lock(&self.status.assigned);
        assigned.retain(|p| !partitions.contains(p));
        lock(&self.shared).context.set_assigned_partitions(assigned.clone());
        tracing::info!(runner = %self.runner, revoked = ?partitions, flushed, dropped, "flushed before revoke");
        Ok(())
    }

    fn unprocessed_offset(&self, partition: &LogPartition) -> Option<u64> {
        lock(&self.shared).revoked_offsets.remove(partition)
    }

    fn on_partitions_assigned(&self, partitions: &[LogPartition]) {
        let mut assigned = lock(&self.status.assigned);
        assigned.extend(partitions.iter().cloned());
        assigned.sort();
        lock(&self.shared).context.set_assigned_partitions(assigned.clone());
        tracing::info!(runner = %self.runner, assigned = ?partitions, "partitions assigned");
    }
}

/// Lowest and highest watermark seen since the last checkpoint.
#[derive(Debug, Default)]
struct WatermarkInterval {
    low: i64,
    high: i64,
}

impl WatermarkInterval {
    fn mark(&mut self, watermark: i64) {
        if self.low == 0 || watermark < self.low {
            self.low = watermark;
        }
        if watermark > self.high {
            self.high = watermark;
        }
    }

    /// Everything up to the highest mark is now committed.
    fn checkpoint(&mut self) -> i64 {
        if self.high > 0 {
            self.low = Watermark::of_value(self.high).completed().value();
        }
        self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drives one computation instance: read, dispatch, retry, checkpoint,
/// timers, rebalance flush.
pub(crate) struct Runner {
    computation_name: String,
    id: String,
    computation: Box<dyn Computation>,
    mapping: ComputationMapping,
    shared: Arc<Mutex<DriverShared>>,
    tailer: Option<LogTailer<Record>>,
    errors: Option<LogAppender<Record>>,
    retry: RetryPolicy,
    timers: Vec<TimerSpec>,
    read_timeout: Duration,
    status: Arc<RunnerStatus>,
    faults: Arc<Mutex<Vec<Fault>>>,
    shutdown_rx: watch::Receiver<bool>,
    watermarks: WatermarkInterval,
    state: ComputationState,
    halted: bool,
}

impl Runner {
    pub(crate) fn create(
        manager: &LogManager,
        topology: &Topology,
        settings: &Settings,
        computation_name: &str,
        index: usize,
        faults: Arc<Mutex<Vec<Fault>>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Runner, Arc<RunnerStatus>), EngineError> {
        let unknown = || EngineError::Topology(format!("unknown computation '{computation_name}'"));
        let supplier = topology.supplier(computation_name).ok_or_else(unknown)?;
        let mapping = topology.metadata(computation_name).ok_or_else(unknown)?.clone();
        let id = format!("{computation_name}-{index}");

        let mut outputs = BTreeMap::new();
        for slot in mapping.metadata().outputs() {
            let stream = mapping
                .map(slot)
                .ok_or_else(|| EngineError::Topology(format!("slot '{slot}' is not mapped")))?;
            outputs.insert(slot.clone(), manager.get_appender(stream, settings.codec(stream))?);
        }

        let status = Arc::new(RunnerStatus::default());
        let shared = Arc::new(Mutex::new(DriverShared {
            context: ComputationContextImpl::new(mapping.metadata().clone()),
            outputs,
            pending: Vec::new(),
            pending_since: None,
            revoked_offsets: HashMap::new(),
        }));

        let inputs = mapping.input_streams();
        let tailer = match inputs.first() {
            None => None,
            Some(first) => {
                let listener = Arc::new(DriverRebalanceListener {
                    runner: id.clone(),
                    shared: shared.clone(),
                    status: status.clone(),
                });
                let group = settings.consumer_group(computation_name);
                Some(manager.subscribe(group, &inputs, listener, settings.codec(first))?)
            }
        };

        let errors = match settings.error_stream(computation_name) {
            Some(stream) => Some(manager.get_appender(stream, settings.codec(stream))?),
            None => None,
        };

        let runner = Runner {
            computation_name: computation_name.to_string(),
            id,
            computation: supplier(),
            mapping,
            shared,
            tailer,
            errors,
            retry: settings.retry_policy(computation_name),
            timers: settings.timers(computation_name).to_vec(),
            read_timeout: settings.read_timeout(),
            status: status.clone(),
            faults,
            shutdown_rx,
            watermarks: WatermarkInterval::default(),
            state: ComputationState::Created,
            halted: false,
        };
        Ok((runner, status))
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(computation = %self.computation_name, runner = %self.id, "runner started");

        let init = {
            let mut shared = lock(&self.shared);
            self.computation.init(&mut shared.context)
        };
        match init {
            Ok(()) => {
                self.set_state(ComputationState::Initialized);
                let now = stream_api::now_ms();
                {
                    let mut shared = lock(&self.shared);
                    for timer in &self.timers {
                        shared.context.set_timer(&timer.name, now + timer.interval.as_millis() as i64);
                    }
                }
                self.set_state(ComputationState::Running);
                if self.after_callback() == Flow::Continue {
                    self.run_loop().await;
                }
            }
            Err(e) => self.record_fault(None, &e.into_fatal().with_context("init")),
        }

        self.set_state(ComputationState::Destroyed);
        self.computation.destroy();
        if let Some(tailer) = self.tailer.as_mut() {
            tailer.close();
        }
        self.status.terminated.store(true, Ordering::Release);
        tracing::info!(computation = %self.computation_name, runner = %self.id, "runner stopped");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    async fn run_loop(&mut self) {
        loop {
            if self.shutdown_requested() {
                break;
            }
            if !self.halted && self.process_timers().await == Flow::Stop {
                break;
            }
            let timeout = self.next_wait();

            let Some(tailer) = self.tailer.as_mut() else {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = self.shutdown_rx.changed() => {}
                }
                continue;
            };
            let read = tokio::select! {
                read = tailer.read(timeout) => read,
                _ = self.shutdown_rx.changed() => continue,
            };

            let mut flow = match read {
                Ok(Some(record)) => {
                    self.enqueue(record);
                    Flow::Continue
                }
                Ok(None) => Flow::Continue,
                Err(StreamError::Decode { offset, source }) => {
                    self.divert(&offset, &source.to_string());
                    Flow::Continue
                }
                Err(StreamError::Closed(what)) => {
                    tracing::info!(runner = %self.id, %what, "input closed");
                    Flow::Stop
                }
                Err(e) => {
                    tracing::warn!(runner = %self.id, error = %e, "read failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    Flow::Continue
                }
            };
            if flow == Flow::Continue && self.batch_ready() {
                flow = self.process_batch().await;
            }
            if flow == Flow::Stop {
                break;
            }
        }
    }

    /// Read timeout, shortened to the next timer deadline and to the end of
    /// the current batch window.
    fn next_wait(&self) -> Duration {
        if self.halted {
            return self.read_timeout;
        }
        let (next_timer, pending_since) = {
            let shared = lock(&self.shared);
            (shared.context.next_timer(), shared.pending_since)
        };
        let mut wait = self.read_timeout;
        if let Some(at) = next_timer {
            let until = (at - stream_api::now_ms()).max(0) as u64;
            wait = wait.min(Duration::from_millis(until));
        }
        if let (Some(since), Some(batch)) = (pending_since, self.retry.batch) {
            wait = wait.min((since + batch.threshold).saturating_duration_since(Instant::now()));
        }
        wait
    }

    /// Whether the pending records form a complete batch.
    fn batch_ready(&self) -> bool {
        let shared = lock(&self.shared);
        let Some(since) = shared.pending_since else {
            return false;
        };
        if shared.pending.len() >= self.retry.batch_capacity() {
            return true;
        }
        self.retry
            .batch
            .is_some_and(|batch| since.elapsed() >= batch.threshold)
    }

    fn set_state(&mut self, state: ComputationState) {
        tracing::trace!(runner = %self.id, %state, "state");
        self.state = state;
    }

    /// Run a callback, retrying retryable failures with backoff. Output of a
    /// failed attempt is discarded.
    async fn invoke<F>(&mut self, mut callback: F) -> Result<(), ComputationError>
    where
        F: FnMut(&mut dyn Computation, &mut ComputationContextImpl) -> Result<(), ComputationError> + Send,
    {
        let mut retry = 0;
        loop {
            let result = {
                let mut shared = lock(&self.shared);
                let mark = shared.context.mark();
                let result = callback(self.computation.as_mut(), &mut shared.context);
                if result.is_err() {
                    shared.context.rollback(mark);
                }
                result
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if err.kind() != FailureKind::Retryable {
                return Err(err);
            }
            if retry >= self.retry.max_retries {
                return Err(err
                    .into_fatal()
                    .with_context(format!("gave up after {} attempts", retry + 1)));
            }
            let delay = self.retry.delay(retry);
            retry += 1;
            tracing::warn!(
                runner = %self.id,
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Queue a record for the next batch. While the runner is halted the
    /// record is left for whoever owns the partition after a restart.
    fn enqueue(&mut self, record: LogRecord<Record>) {
        if self.halted {
            if let Some(tailer) = self.tailer.as_mut() {
                let _ = tailer.seek(record.offset());
                let _ = tailer.pause(record.offset().partition());
            }
            return;
        }
        tracing::trace!(runner = %self.id, offset = %record.offset(), key = %record.message().key(), "record read");
        let mut shared = lock(&self.shared);
        shared.pending_since.get_or_insert_with(Instant::now);
        shared.pending.push(record);
    }

    /// Hand the pending records to the computation as one unit of retry.
    async fn process_batch(&mut self) -> Flow {
        let batch = {
            let mut shared = lock(&self.shared);
            shared.pending_since = None;
            std::mem::take(&mut shared.pending)
        };
        if batch.is_empty() {
            return Flow::Continue;
        }
        let slots: Vec<String> = batch
            .iter()
            .map(|r| {
                let stream = r.offset().partition().name();
                self.mapping.reverse_map(stream).unwrap_or(stream).to_string()
            })
            .collect();
        let runner = self.id.clone();

        self.set_state(ComputationState::ProcessingRecord);
        let result = self
            .invoke(|computation, ctx| {
                for (record, slot) in batch.iter().zip(&slots) {
                    let mark = ctx.mark();
                    match computation.process_record(ctx, slot, record.message()) {
                        Ok(()) => {}
                        Err(e) if e.kind() == FailureKind::Skip => {
                            ctx.rollback(mark);
                            tracing::warn!(runner = %runner, offset = %record.offset(), error = %e, "record skipped");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .await;
        self.set_state(ComputationState::Running);

        match result {
            Ok(()) => {}
            Err(e) if self.retry.continue_on_failure => {
                tracing::error!(
                    runner = %self.id,
                    first = %batch[0].offset(),
                    records = batch.len(),
                    error = %e,
                    "batch failed, skipped"
                );
                lock(&self.shared).context.ask_for_checkpoint();
            }
            Err(e) => {
                let mut partitions: Vec<LogPartition> =
                    batch.iter().map(|r| r.offset().partition().clone()).collect();
                partitions.sort();
                partitions.dedup();
                for partition in partitions {
                    self.halt(Some(partition), &e);
                }
                return Flow::Continue;
            }
        }
        for record in &batch {
            self.mark_watermark(record.message().watermark());
        }
        self.after_callback()
    }

    async fn process_timers(&mut self) -> Flow {
        let now = stream_api::now_ms();
        let due = lock(&self.shared).context.take_expired_timers(now);
        // A timer may checkpoint, records read before it go first.
        if !due.is_empty() && self.process_batch().await == Flow::Stop {
            return Flow::Stop;
        }
        for (key, at) in due {
            self.set_state(ComputationState::ProcessingTimer);
            let result = self
                .invoke(|computation, ctx| computation.process_timer(ctx, &key, at))
                .await;
            self.set_state(ComputationState::Running);
            self.rearm(&key, now);

            match result {
                Ok(()) => {}
                Err(e) if e.kind() == FailureKind::Skip => {
                    tracing::warn!(runner = %self.id, timer = %key, error = %e, "timer skipped");
                }
                Err(e) => {
                    self.halt(None, &e);
                    return Flow::Continue;
                }
            }
            if self.after_callback() == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Re-arm a configured periodic timer unless the computation did.
    fn rearm(&mut self, key: &str, now: i64) {
        let Some(spec) = self.timers.iter().find(|t| t.name == key) else {
            return;
        };
        let mut shared = lock(&self.shared);
        if !shared.context.has_timer(key) {
            shared.context.set_timer(key, now + spec.interval.as_millis() as i64);
        }
    }

    /// Checkpoint and termination requests raised by the last callback.
    fn after_callback(&mut self) -> Flow {
        let (checkpoint, terminate) = {
            let shared = lock(&self.shared);
            (shared.context.require_checkpoint(), shared.context.require_terminate())
        };
        if checkpoint {
            if let Err(e) = self.checkpoint() {
                self.halt(None, &ComputationError::fatal(e).with_context("checkpoint"));
                return Flow::Continue;
            }
        }
        if terminate {
            tracing::info!(runner = %self.id, "termination requested");
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Flush every buffered record, then commit consumed offsets.
    fn checkpoint(&mut self) -> Result<(), StreamError> {
        let (flushed, source_watermark) = {
            let mut shared = lock(&self.shared);
            let flushed = shared.flush()?;
            shared.context.clear_checkpoint_flag();
            (flushed, shared.context.source_low_watermark())
        };
        if let Some(tailer) = self.tailer.as_mut() {
            tailer.commit()?;
        }
        let low = if source_watermark > 0 {
            source_watermark
        } else {
            self.watermarks.checkpoint()
        };
        self.status.low_watermark.store(low, Ordering::Release);
        tracing::debug!(runner = %self.id, flushed, low_watermark = %Watermark::of_value(low), "checkpoint");
        Ok(())
    }

    fn mark_watermark(&mut self, watermark: i64) {
        self.watermarks.mark(watermark);
        let published = self.status.low_watermark();
        if published == 0 || watermark < published {
            self.status.low_watermark.store(watermark, Ordering::Release);
        }
    }

    /// Stop processing a partition, or the whole runner when `partition` is
    /// `None`. The batch is dropped and positions go back to the last commit.
    fn halt(&mut self, partition: Option<LogPartition>, err: &ComputationError) {
        {
            let mut shared = lock(&self.shared);
            shared.context.clear_records();
            shared.context.clear_checkpoint_flag();
            shared.pending.clear();
            shared.pending_since = None;
        }
        if let Some(tailer) = self.tailer.as_mut() {
            if let Err(e) = tailer.to_last_committed() {
                tracing::warn!(runner = %self.id, error = %e, "cannot rewind to last committed");
            }
            let paused = match &partition {
                Some(p) => vec![p.clone()],
                None => tailer.assignments().to_vec(),
            };
            for p in &paused {
                let _ = tailer.pause(p);
            }
        }
        if partition.is_none() {
            self.halted = true;
        }
        self.record_fault(partition, err);
    }

    fn record_fault(&self, partition: Option<LogPartition>, err: &ComputationError) {
        tracing::error!(
            computation = %self.computation_name,
            runner = %self.id,
            partition = ?partition,
            error = %err,
            "computation fault, processing halted"
        );
        lock(&self.faults).push(Fault {
            computation: self.computation_name.clone(),
            runner: self.id.clone(),
            partition,
            kind: err.kind().to_string(),
            cause: err.cause().to_string(),
            at_ms: stream_api::now_ms(),
        });
    }

    /// Send an undecodable record to the error stream, or drop it.
    fn divert(&self, offset: &LogOffset, error: &str) {
        let Some(errors) = &self.errors else {
            tracing::warn!(runner = %self.id, offset = %offset, error, "skipping malformed record");
            return;
        };
        let payload = serde_json::json!({
            "stream": offset.partition().name(),
            "partition": offset.partition().partition(),
            "offset": offset.offset(),
            "error": error,
        });
        let key = format!("{}:{}", offset.partition(), offset.offset());
        let record = Record::new(
            key,
            payload.to_string().into_bytes(),
            Watermark::now(),
            RecordFlags::POISON_PILL,
        );
        match errors.append(record.key(), &record) {
            Ok(at) => tracing::warn!(runner = %self.id, offset = %offset, diverted_to = %at, error, "malformed record diverted"),
            Err(e) => tracing::error!(runner = %self.id, offset = %offset, error = %e, "cannot divert malformed record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_interval_completes_on_checkpoint() {
        let mut interval = WatermarkInterval::default();
        interval.mark(Watermark::of_timestamp(20, 0).value());
        interval.mark(Watermark::of_timestamp(10, 0).value());
        assert_eq!(interval.low, Watermark::of_timestamp(10, 0).value());

        let low = Watermark::of_value(interval.checkpoint());
        assert!(low.is_completed());
        assert_eq!(low.timestamp(), 20);

        interval.mark(Watermark::of_timestamp(15, 0).value());
        assert_eq!(Watermark::of_value(interval.low).timestamp(), 15);
    }
}
