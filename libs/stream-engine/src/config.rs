use std::time::Duration;

use serde::Deserialize;

use stream_api::codec::record_codec;

use crate::computations;
use crate::error::EngineError;
use crate::settings::{RetryPolicy, Settings, TimerSpec};
use crate::topology::Topology;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Upper bound of a single tailer read.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Storage backend settings, handed as is to the binary.
    #[serde(default)]
    pub storage: Option<toml::Value>,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub streams: Vec<StreamEntryConfig>,

    #[serde(default)]
    pub computations: Vec<ComputationConfig>,
}

fn default_read_timeout_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_partitions() -> u32 {
    4
}

fn default_concurrency() -> usize {
    1
}

fn default_codec() -> String {
    "record".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            concurrency: default_concurrency(),
            codec: default_codec(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Records per batch, absent or 1 for record by record delivery.
    #[serde(default)]
    pub batch_capacity: Option<usize>,
    #[serde(default = "default_batch_threshold_ms")]
    pub batch_threshold_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_batch_threshold_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            continue_on_failure: false,
            batch_capacity: None,
            batch_threshold_ms: default_batch_threshold_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .with_continue_on_failure(self.continue_on_failure);
        match self.batch_capacity {
            Some(capacity) if capacity > 1 => {
                policy.with_batch(capacity, Duration::from_millis(self.batch_threshold_ms))
            }
            _ => policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEntryConfig {
    pub name: String,
    #[serde(default)]
    pub partitions: Option<u32>,
    #[serde(default)]
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    pub name: String,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputationConfig {
    pub name: String,
    /// Built-in computation: `forward`, `counter` or `generator`.
    pub kind: String,
    /// `slot:stream` bindings, e.g. `"i1:s1"`.
    pub streams: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub error_stream: Option<String>,
    #[serde(default)]
    pub timers: Vec<TimerConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Partitions of the output streams not declared in `streams`.
    #[serde(default)]
    pub partitions: Option<u32>,
    /// Codec of the output streams not declared in `streams`.
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

impl ComputationConfig {
    /// Slot counts derived from the bindings: the highest `iN` and `oN`.
    fn slot_counts(&self) -> Result<(usize, usize), EngineError> {
        let mut inputs = 0;
        let mut outputs = 0;
        for binding in &self.streams {
            let slot = binding.split_once(':').map(|(slot, _)| slot).unwrap_or(binding);
            let (count, index) = match slot.split_at_checked(1) {
                Some(("i", n)) => (&mut inputs, n),
                Some(("o", n)) => (&mut outputs, n),
                _ => return Err(EngineError::Config(format!("invalid slot in '{binding}'"))),
            };
            let index: usize = index
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid slot in '{binding}'")))?;
            *count = (*count).max(index);
        }
        Ok((inputs, outputs))
    }

    fn output_streams(&self) -> impl Iterator<Item = &str> {
        self.streams
            .iter()
            .filter(|b| b.starts_with('o'))
            .filter_map(|b| b.split_once(':').map(|(_, stream)| stream))
    }
}

impl StreamConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Runtime settings. Stream entries win over computation level defaults.
    pub fn settings(&self) -> Result<Settings, EngineError> {
        let mut settings = Settings::new(self.defaults.concurrency, self.defaults.partitions)
            .with_codec(codec(&self.defaults.codec)?)
            .with_retry_policy(self.defaults.retry.policy())
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms));

        for computation in &self.computations {
            let name = computation.name.as_str();
            let ctx = format!("computation '{name}'");
            for stream in computation.output_streams() {
                if let Some(partitions) = computation.partitions {
                    settings = settings.set_partitions(stream, partitions);
                }
                if let Some(codec_name) = &computation.codec {
                    settings = settings.set_codec(stream, codec(codec_name).map_err(|e| e.with_context(&ctx))?);
                }
            }
            if let Some(concurrency) = computation.concurrency {
                settings = settings.set_concurrency(name, concurrency);
            }
            if let Some(group) = &computation.consumer_group {
                settings = settings.set_consumer_group(name, group);
            }
            if let Some(stream) = &computation.error_stream {
                settings = settings.set_error_stream(name, stream);
            }
            if let Some(retry) = &computation.retry {
                settings = settings.set_retry_policy(name, retry.policy());
            }
            for timer in &computation.timers {
                if timer.interval_ms == 0 {
                    return Err(EngineError::Config(format!("{ctx}: timer '{}' has no interval", timer.name)));
                }
                settings = settings.add_timer(
                    name,
                    TimerSpec::new(timer.name.clone(), Duration::from_millis(timer.interval_ms)),
                );
            }
        }

        for stream in &self.streams {
            let ctx = format!("stream '{}'", stream.name);
            if let Some(partitions) = stream.partitions {
                if partitions == 0 {
                    return Err(EngineError::Config(format!("{ctx}: partitions must be positive")));
                }
                settings = settings.set_partitions(&stream.name, partitions);
            }
            if let Some(codec_name) = &stream.codec {
                settings = settings.set_codec(&stream.name, codec(codec_name).map_err(|e| e.with_context(&ctx))?);
            }
        }
        Ok(settings)
    }

    /// Topology of the built-in computations.
    pub fn topology(&self) -> Result<Topology, EngineError> {
        let mut builder = Topology::builder();
        for computation in &self.computations {
            let ctx = format!("computation '{}'", computation.name);
            let (inputs, outputs) = computation.slot_counts().map_err(|e| e.with_context(&ctx))?;
            let supplier = computations::builtin(
                &computation.kind,
                &computation.name,
                inputs,
                outputs,
                computation.config.as_ref(),
            )
            .map_err(|e| e.with_context(&ctx))?;
            builder = builder.add_computation(move || supplier(), computation.streams.clone());
        }
        builder.build()
    }
}

fn codec(name: &str) -> Result<std::sync::Arc<dyn stream_api::Codec<stream_api::Record>>, EngineError> {
    record_codec(name).ok_or_else(|| EngineError::Config(format!("unknown codec '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BatchPolicy;

    const SAMPLE: &str = r#"
read_timeout_ms = 50

[defaults]
partitions = 2

[[streams]]
name = "numbers"
partitions = 3

[[streams]]
name = "errors"
partitions = 1
codec = "json"

[[computations]]
name = "GEN"
kind = "generator"
streams = ["o1:numbers"]
config = { records = 20, batch_size = 5 }

[[computations]]
name = "FWD"
kind = "forward"
streams = ["i1:numbers", "o1:copies"]
concurrency = 2
error_stream = "errors"
retry = { max_retries = 5, backoff_ms = 50, continue_on_failure = true, batch_capacity = 10, batch_threshold_ms = 200 }

[[computations]]
name = "COUNT"
kind = "counter"
streams = ["i1:copies", "o1:counts"]
consumer_group = "counting"
partitions = 1
timers = [{ name = "report", interval_ms = 1000 }]
"#;

    #[test]
    fn parse_defaults() {
        let config = StreamConfig::parse("").unwrap();
        assert_eq!(config.read_timeout_ms, 200);
        assert_eq!(config.defaults.partitions, 4);
        assert_eq!(config.defaults.codec, "record");
        assert_eq!(config.defaults.retry, RetryConfig::default());
        assert!(config.computations.is_empty());
    }

    #[test]
    fn settings_from_sample() {
        let config = StreamConfig::parse(SAMPLE).unwrap();
        let settings = config.settings().unwrap();

        assert_eq!(settings.partitions("numbers"), 3);
        assert_eq!(settings.partitions("counts"), 1);
        assert_eq!(settings.partitions("copies"), 2);
        assert_eq!(settings.codec("errors").name(), "json");
        assert_eq!(settings.concurrency("FWD"), 2);
        assert_eq!(settings.consumer_group("COUNT"), "counting");
        assert_eq!(settings.error_stream("FWD"), Some("errors"));
        assert_eq!(settings.retry_policy("FWD").max_retries, 5);
        assert_eq!(settings.retry_policy("FWD").max_backoff, Duration::from_secs(5));
        assert!(settings.retry_policy("FWD").continue_on_failure);
        assert_eq!(
            settings.retry_policy("FWD").batch,
            Some(BatchPolicy::new(10, Duration::from_millis(200)))
        );
        assert_eq!(settings.retry_policy("COUNT").batch, None);
        assert_eq!(settings.timers("COUNT")[0].interval, Duration::from_secs(1));
        assert_eq!(settings.read_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn topology_from_sample() {
        let topology = StreamConfig::parse(SAMPLE).unwrap().topology().unwrap();
        assert_eq!(topology.computations(), vec!["GEN", "FWD", "COUNT"]);
        assert!(topology.is_source("GEN"));
        assert_eq!(topology.children("copies"), vec!["COUNT"]);
    }

    #[test]
    fn invalid_entries_are_reported() {
        let unknown_codec = StreamConfig::parse("[[streams]]\nname = \"s\"\ncodec = \"xml\"").unwrap();
        assert!(matches!(unknown_codec.settings(), Err(EngineError::Config(msg)) if msg.contains("unknown codec 'xml'")));

        let bad_slot = StreamConfig::parse(
            "[[computations]]\nname = \"F\"\nkind = \"forward\"\nstreams = [\"x1:s\"]",
        )
        .unwrap();
        assert!(matches!(bad_slot.topology(), Err(EngineError::Config(msg)) if msg.contains("computation 'F'")));
    }
}
