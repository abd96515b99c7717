use std::fmt;

use crate::error::{ComputationError, StreamError};
use crate::log::LogPartition;
use crate::record::Record;

/// Name and logical stream slots of a computation.
///
/// Slots are positional names (`i1..iN`, `o1..oN` by default) bound to
/// concrete streams when a topology is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl ComputationMetadata {
    pub fn new(name: impl Into<String>, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
        }
    }

    /// Metadata with `inputs` default input slots and `outputs` default output slots.
    pub fn with_counts(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        Self::new(
            name,
            (1..=inputs).map(|i| format!("i{i}")).collect(),
            (1..=outputs).map(|i| format!("o{i}")).collect(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
}

/// Lifecycle of one computation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputationState {
    Created,
    Initialized,
    Running,
    ProcessingRecord,
    ProcessingTimer,
    Destroyed,
}

impl fmt::Display for ComputationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputationState::Created => "created",
            ComputationState::Initialized => "initialized",
            ComputationState::Running => "running",
            ComputationState::ProcessingRecord => "processing_record",
            ComputationState::ProcessingTimer => "processing_timer",
            ComputationState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// The only mutation surface offered to a computation.
///
/// Produced records are buffered per output slot and only become visible
/// once the driver flushes them, which happens before offsets are committed.
pub trait ComputationContext: Send {
    /// Buffer a record on an output slot. Unknown slots are fatal.
    fn produce_record(&mut self, output: &str, record: Record) -> Result<(), ComputationError>;

    /// Buffer a copy of the record on every output slot.
    fn produce_record_to_all(&mut self, record: Record) -> Result<(), ComputationError>;

    /// Arm (or re-arm) the timer `key` to fire at `time_ms` (epoch millis).
    fn set_timer(&mut self, key: &str, time_ms: i64);

    /// Request a flush of outputs then a commit of consumed offsets.
    fn ask_for_checkpoint(&mut self);

    fn require_checkpoint(&self) -> bool;

    /// Request the runner to stop after the current batch.
    fn ask_for_termination(&mut self);

    fn require_terminate(&self) -> bool;

    /// Records buffered on an output slot and not flushed yet.
    fn get_records(&self, output: &str) -> &[Record];

    /// Low watermark reported by a source computation.
    fn set_source_low_watermark(&mut self, watermark: i64);

    fn assigned_partitions(&self) -> &[LogPartition];

    fn metadata(&self) -> &ComputationMetadata;
}

/// A processing unit consuming records from input slots and producing
/// records on output slots.
///
/// Callbacks are never invoked concurrently on the same instance.
pub trait Computation: Send {
    fn metadata(&self) -> ComputationMetadata;

    /// Called once before any other callback.
    fn init(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), ComputationError>;

    /// Called once per inbound record, in partition order.
    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        input: &str,
        record: &Record,
    ) -> Result<(), ComputationError>;

    fn process_timer(
        &mut self,
        _ctx: &mut dyn ComputationContext,
        _key: &str,
        _time_ms: i64,
    ) -> Result<(), ComputationError> {
        Ok(())
    }

    /// Called once at shutdown or after a fatal abort, also when `init` failed.
    fn destroy(&mut self) {}
}

/// Creates computation instances, one per runner.
pub type ComputationSupplier = std::sync::Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Notified by a subscribed tailer when the group reassigns partitions.
///
/// `on_partitions_revoked` runs before the revoked partitions are committed
/// and released: anything buffered for them must be flushed there.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, partitions: &[LogPartition]) -> Result<(), StreamError>;

    fn on_partitions_assigned(&self, partitions: &[LogPartition]);

    /// First offset of a revoked partition that was read but not processed.
    /// The revoke commit stops there instead of at the read position.
    fn unprocessed_offset(&self, _partition: &LogPartition) -> Option<u64> {
        None
    }
}

/// Listener for tailers that don't care about rebalances.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRebalanceListener;

impl RebalanceListener for NoopRebalanceListener {
    fn on_partitions_revoked(&self, _partitions: &[LogPartition]) -> Result<(), StreamError> {
        Ok(())
    }

    fn on_partitions_assigned(&self, _partitions: &[LogPartition]) {}
}
