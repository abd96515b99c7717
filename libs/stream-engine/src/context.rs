use std::collections::{BTreeMap, HashMap};

use stream_api::computation::{ComputationContext, ComputationMetadata};
use stream_api::log::LogPartition;
use stream_api::{ComputationError, Record};

/// Context handed to computation callbacks by the runner.
///
/// Buffers produced records per output slot until the runner flushes them.
#[derive(Debug)]
pub struct ComputationContextImpl {
    metadata: ComputationMetadata,
    records: BTreeMap<String, Vec<Record>>,
    timers: HashMap<String, i64>,
    checkpoint: bool,
    terminate: bool,
    source_low_watermark: i64,
    partitions: Vec<LogPartition>,
}

/// State of a context before a callback, used to undo a failed attempt.
#[derive(Debug, Clone)]
pub(crate) struct ContextMark {
    lengths: BTreeMap<String, usize>,
    timers: HashMap<String, i64>,
    checkpoint: bool,
    terminate: bool,
    source_low_watermark: i64,
}

impl ComputationContextImpl {
    pub fn new(metadata: ComputationMetadata) -> Self {
        let records = metadata.outputs().iter().map(|o| (o.clone(), Vec::new())).collect();
        Self {
            metadata,
            records,
            timers: HashMap::new(),
            checkpoint: false,
            terminate: false,
            source_low_watermark: 0,
            partitions: Vec::new(),
        }
    }

    /// Timers due at `now_ms`, earliest first. They are disarmed.
    pub fn take_expired_timers(&mut self, now_ms: i64) -> Vec<(String, i64)> {
        let mut due: Vec<(String, i64)> = self
            .timers
            .iter()
            .filter(|(_, at)| **at <= now_ms)
            .map(|(k, at)| (k.clone(), *at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (key, _) in &due {
            self.timers.remove(key);
        }
        due
    }

    pub fn next_timer(&self) -> Option<i64> {
        self.timers.values().min().copied()
    }

    pub fn has_timer(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    pub fn clear_checkpoint_flag(&mut self) {
        self.checkpoint = false;
    }

    /// Drop every buffered record.
    pub fn clear_records(&mut self) {
        for records in self.records.values_mut() {
            records.clear();
        }
    }

    pub fn buffered(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn source_low_watermark(&self) -> i64 {
        self.source_low_watermark
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<Record>)> {
        self.records.iter_mut()
    }

    pub(crate) fn set_assigned_partitions(&mut self, partitions: Vec<LogPartition>) {
        self.partitions = partitions;
    }

    pub(crate) fn mark(&self) -> ContextMark {
        ContextMark {
            lengths: self.records.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            timers: self.timers.clone(),
            checkpoint: self.checkpoint,
            terminate: self.terminate,
            source_low_watermark: self.source_low_watermark,
        }
    }

    pub(crate) fn rollback(&mut self, mark: ContextMark) {
        for (slot, records) in self.records.iter_mut() {
            records.truncate(mark.lengths.get(slot).copied().unwrap_or(0));
        }
        self.timers = mark.timers;
        self.checkpoint = mark.checkpoint;
        self.terminate = mark.terminate;
        self.source_low_watermark = mark.source_low_watermark;
    }
}

impl ComputationContext for ComputationContextImpl {
    fn produce_record(&mut self, output: &str, record: Record) -> Result<(), ComputationError> {
        match self.records.get_mut(output) {
            Some(records) => {
                records.push(record);
                Ok(())
            }
            None => Err(ComputationError::fatal(format!(
                "unknown output stream '{output}' for computation '{}'",
                self.metadata.name()
            ))),
        }
    }

    fn produce_record_to_all(&mut self, record: Record) -> Result<(), ComputationError> {
        for records in self.records.values_mut() {
            records.push(record.clone());
        }
        Ok(())
    }

    fn set_timer(&mut self, key: &str, time_ms: i64) {
        self.timers.insert(key.to_string(), time_ms);
    }

    fn ask_for_checkpoint(&mut self) {
        self.checkpoint = true;
    }

    fn require_checkpoint(&self) -> bool {
        self.checkpoint
    }

    fn ask_for_termination(&mut self) {
        self.terminate = true;
    }

    fn require_terminate(&self) -> bool {
        self.terminate
    }

    fn get_records(&self, output: &str) -> &[Record] {
        self.records.get(output).map(Vec::as_slice).unwrap_or(&[])
    }

    fn set_source_low_watermark(&mut self, watermark: i64) {
        self.source_low_watermark = watermark;
    }

    fn assigned_partitions(&self) -> &[LogPartition] {
        &self.partitions
    }

    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_api::FailureKind;

    fn ctx() -> ComputationContextImpl {
        ComputationContextImpl::new(ComputationMetadata::with_counts("C1", 1, 2))
    }

    #[test]
    fn records_are_buffered_per_output() {
        let mut ctx = ctx();
        ctx.produce_record("o1", Record::of("k", "a")).unwrap();
        ctx.produce_record_to_all(Record::of("k", "b")).unwrap();
        assert_eq!(ctx.get_records("o1").len(), 2);
        assert_eq!(ctx.get_records("o2").len(), 1);
        assert!(ctx.get_records("o3").is_empty());

        let err = ctx.produce_record("o3", Record::of("k", "c")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(ctx.buffered(), 3);
    }

    #[test]
    fn rollback_discards_the_failed_attempt() {
        let mut ctx = ctx();
        ctx.produce_record("o1", Record::of("k", "kept")).unwrap();
        let mark = ctx.mark();

        ctx.produce_record("o1", Record::of("k", "dropped")).unwrap();
        ctx.set_timer("t", 10);
        ctx.ask_for_checkpoint();
        ctx.rollback(mark);

        assert_eq!(ctx.get_records("o1").len(), 1);
        assert_eq!(ctx.get_records("o1")[0].data(), b"kept");
        assert!(!ctx.require_checkpoint());
        assert_eq!(ctx.next_timer(), None);
    }

    #[test]
    fn expired_timers_fire_in_time_order() {
        let mut ctx = ctx();
        ctx.set_timer("late", 30);
        ctx.set_timer("early", 10);
        ctx.set_timer("future", 100);
        ctx.set_timer("early", 20);

        let due = ctx.take_expired_timers(50);
        assert_eq!(due, vec![("early".to_string(), 20), ("late".to_string(), 30)]);
        assert_eq!(ctx.next_timer(), Some(100));
        assert!(ctx.has_timer("future"));
    }
}
