//! Built-in computations usable from a configuration file.

use std::sync::Arc;

use serde::Deserialize;

use stream_api::computation::{
    Computation, ComputationContext, ComputationMetadata, ComputationSupplier,
};
use stream_api::{ComputationError, Record, RecordFlags, Watermark};

use crate::error::EngineError;

/// Copy every input record to every output, checkpointing after each one.
#[derive(Debug)]
pub struct ForwardComputation {
    metadata: ComputationMetadata,
}

impl ForwardComputation {
    pub fn new(name: &str, inputs: usize, outputs: usize) -> Self {
        Self {
            metadata: ComputationMetadata::with_counts(name, inputs, outputs),
        }
    }
}

impl Computation for ForwardComputation {
    fn metadata(&self) -> ComputationMetadata {
        self.metadata.clone()
    }

    fn init(&mut self, _ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
        Ok(())
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input: &str,
        record: &Record,
    ) -> Result<(), ComputationError> {
        ctx.produce_record_to_all(record.clone())?;
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterConfig {
    #[serde(default = "default_count_interval_ms")]
    pub interval_ms: u64,
}

fn default_count_interval_ms() -> u64 {
    1000
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_count_interval_ms(),
        }
    }
}

/// Count input records and emit the count on every timer tick.
///
/// Offsets are only committed on ticks, so a crash replays the records of
/// the current interval.
#[derive(Debug)]
pub struct CounterComputation {
    metadata: ComputationMetadata,
    interval_ms: i64,
    count: u64,
    high_watermark: i64,
}

impl CounterComputation {
    pub const TIMER: &'static str = "count";

    pub fn new(name: &str, inputs: usize, outputs: usize, config: CounterConfig) -> Self {
        Self {
            metadata: ComputationMetadata::with_counts(name, inputs, outputs),
            interval_ms: config.interval_ms as i64,
            count: 0,
            high_watermark: 0,
        }
    }
}

impl Computation for CounterComputation {
    fn metadata(&self) -> ComputationMetadata {
        self.metadata.clone()
    }

    fn init(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
        ctx.set_timer(Self::TIMER, stream_api::now_ms() + self.interval_ms);
        Ok(())
    }

    fn process_record(
        &mut self,
        _ctx: &mut dyn ComputationContext,
        _input: &str,
        record: &Record,
    ) -> Result<(), ComputationError> {
        self.count += 1;
        self.high_watermark = self.high_watermark.max(record.watermark());
        Ok(())
    }

    fn process_timer(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _key: &str,
        time_ms: i64,
    ) -> Result<(), ComputationError> {
        if self.count > 0 {
            let record = Record::new(
                Self::TIMER,
                self.count.to_string(),
                Watermark::of_value(self.high_watermark),
                RecordFlags::DEFAULT,
            );
            ctx.produce_record_to_all(record)?;
            tracing::debug!(computation = %self.metadata.name(), count = self.count, "count emitted");
            self.count = 0;
        }
        ctx.ask_for_checkpoint();
        ctx.set_timer(Self::TIMER, time_ms + self.interval_ms);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Records to produce in total.
    #[serde(default = "default_records")]
    pub records: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Distinct keys, records are spread over them round-robin.
    #[serde(default = "default_keys")]
    pub keys: u64,
    #[serde(default = "default_generate_interval_ms")]
    pub interval_ms: u64,
    /// Event time of the last record plus one, now when absent.
    #[serde(default)]
    pub target_timestamp_ms: Option<i64>,
}

fn default_records() -> u64 {
    100
}

fn default_batch_size() -> u64 {
    10
}

fn default_keys() -> u64 {
    10
}

fn default_generate_interval_ms() -> u64 {
    1
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            records: default_records(),
            batch_size: default_batch_size(),
            keys: default_keys(),
            interval_ms: default_generate_interval_ms(),
            target_timestamp_ms: None,
        }
    }
}

/// Source producing keyed records in timer driven batches, then a completed
/// low watermark and termination.
#[derive(Debug)]
pub struct GeneratorComputation {
    metadata: ComputationMetadata,
    config: GeneratorConfig,
    target_ts: i64,
    produced: u64,
}

impl GeneratorComputation {
    pub const TIMER: &'static str = "generate";

    pub fn new(name: &str, outputs: usize, config: GeneratorConfig) -> Self {
        let target_ts = config.target_timestamp_ms.unwrap_or_else(stream_api::now_ms);
        Self {
            metadata: ComputationMetadata::with_counts(name, 0, outputs),
            config,
            target_ts,
            produced: 0,
        }
    }

    fn finish(&self, ctx: &mut dyn ComputationContext) {
        let last = Watermark::of_timestamp(self.target_ts - 1, 0);
        ctx.set_source_low_watermark(last.completed().value());
        ctx.ask_for_checkpoint();
        ctx.ask_for_termination();
        tracing::info!(computation = %self.metadata.name(), records = self.produced, "generator done");
    }
}

impl Computation for GeneratorComputation {
    fn metadata(&self) -> ComputationMetadata {
        self.metadata.clone()
    }

    fn init(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
        if self.config.records == 0 {
            self.finish(ctx);
            return Ok(());
        }
        ctx.set_timer(Self::TIMER, stream_api::now_ms());
        Ok(())
    }

    fn process_record(
        &mut self,
        _ctx: &mut dyn ComputationContext,
        _input: &str,
        _record: &Record,
    ) -> Result<(), ComputationError> {
        Err(ComputationError::skip("a generator has no input"))
    }

    fn process_timer(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _key: &str,
        time_ms: i64,
    ) -> Result<(), ComputationError> {
        let total = self.config.records;
        let end = (self.produced + self.config.batch_size.max(1)).min(total);
        let keys = self.config.keys.max(1);
        let mut watermark = Watermark::LOWEST;
        for i in self.produced..end {
            let ts = self.target_ts - total as i64 + i as i64;
            watermark = Watermark::of_timestamp(ts, 0);
            let record = Record::new(format!("key{}", i % keys), i.to_string(), watermark, RecordFlags::DEFAULT);
            ctx.produce_record_to_all(record)?;
        }
        // Only advance once the batch is buffered, a failed attempt is replayed.
        self.produced = end;

        if self.produced >= total {
            self.finish(ctx);
        } else {
            ctx.set_source_low_watermark(watermark.value());
            ctx.ask_for_checkpoint();
            ctx.set_timer(Self::TIMER, time_ms + self.config.interval_ms as i64);
        }
        Ok(())
    }
}

/// Supplier of a built-in computation by kind: `forward`, `counter` or
/// `generator`. `config` is the kind specific table.
pub fn builtin(
    kind: &str,
    name: &str,
    inputs: usize,
    outputs: usize,
    config: Option<&toml::Value>,
) -> Result<ComputationSupplier, EngineError> {
    let name = name.to_string();
    let supplier: ComputationSupplier = match kind {
        "forward" => Arc::new(move || Box::new(ForwardComputation::new(&name, inputs, outputs)) as Box<dyn Computation>),
        "counter" => {
            let config: CounterConfig = parse_config(config)?;
            Arc::new(move || {
                Box::new(CounterComputation::new(&name, inputs, outputs, config.clone())) as Box<dyn Computation>
            })
        }
        "generator" => {
            if inputs > 0 {
                return Err(EngineError::Config(format!("generator '{name}' cannot have inputs")));
            }
            let config: GeneratorConfig = parse_config(config)?;
            Arc::new(move || Box::new(GeneratorComputation::new(&name, outputs, config.clone())) as Box<dyn Computation>)
        }
        other => return Err(EngineError::Config(format!("unknown computation kind '{other}'"))),
    };
    Ok(supplier)
}

fn parse_config<T>(config: Option<&toml::Value>) -> Result<T, EngineError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match config {
        Some(value) => value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| EngineError::Config(e.to_string())),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComputationContextImpl;

    #[test]
    fn forward_copies_to_every_output() {
        let mut forward = ForwardComputation::new("F", 1, 2);
        let mut ctx = ComputationContextImpl::new(forward.metadata());
        forward.process_record(&mut ctx, "i1", &Record::of("k", "v")).unwrap();

        assert_eq!(ctx.get_records("o1").len(), 1);
        assert_eq!(ctx.get_records("o2").len(), 1);
        assert!(ctx.require_checkpoint());
    }

    #[test]
    fn counter_emits_on_timer() {
        let mut counter = CounterComputation::new("C", 1, 1, CounterConfig { interval_ms: 10 });
        let mut ctx = ComputationContextImpl::new(counter.metadata());
        counter.init(&mut ctx).unwrap();
        for _ in 0..3 {
            counter.process_record(&mut ctx, "i1", &Record::of("k", "v")).unwrap();
        }
        assert!(!ctx.require_checkpoint());

        counter.process_timer(&mut ctx, CounterComputation::TIMER, 100).unwrap();
        assert_eq!(ctx.get_records("o1")[0].data(), b"3");
        assert!(ctx.require_checkpoint());
        assert_eq!(ctx.next_timer(), Some(110));
    }

    #[test]
    fn generator_produces_batches_then_terminates() {
        let config = GeneratorConfig {
            records: 5,
            batch_size: 3,
            keys: 2,
            interval_ms: 1,
            target_timestamp_ms: Some(1_000),
        };
        let mut generator = GeneratorComputation::new("G", 1, config);
        let mut ctx = ComputationContextImpl::new(generator.metadata());
        generator.init(&mut ctx).unwrap();

        generator.process_timer(&mut ctx, GeneratorComputation::TIMER, 0).unwrap();
        assert_eq!(ctx.get_records("o1").len(), 3);
        assert!(!ctx.require_terminate());

        generator.process_timer(&mut ctx, GeneratorComputation::TIMER, 1).unwrap();
        let records = ctx.get_records("o1");
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].key(), "key0");
        assert_eq!(Watermark::of_value(records[4].watermark()).timestamp(), 999);
        assert!(ctx.require_terminate());
        assert!(Watermark::of_value(ctx.source_low_watermark()).is_completed());
    }

    #[test]
    fn builtin_kinds_are_resolved() {
        let table: toml::Value = toml::from_str("records = 7").unwrap();
        let supplier = builtin("generator", "G", 0, 1, Some(&table)).unwrap();
        assert_eq!(supplier().metadata().outputs().len(), 1);

        assert!(builtin("forward", "F", 1, 1, None).is_ok());
        assert!(matches!(builtin("generator", "G", 1, 1, None), Err(EngineError::Config(_))));
        assert!(matches!(builtin("sorter", "S", 1, 1, None), Err(EngineError::Config(_))));
    }
}
