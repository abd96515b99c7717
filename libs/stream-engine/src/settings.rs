use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stream_api::codec::{Codec, RecordCodec};
use stream_api::record::Record;

/// Records handed to a computation as one unit of retry: at most
/// `capacity` records, or what was read within `threshold` of the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub capacity: usize,
    pub threshold: Duration,
}

impl BatchPolicy {
    pub fn new(capacity: usize, threshold: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            threshold,
        }
    }
}

/// Bounded exponential backoff for retryable computation failures, and what
/// to do once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, 0 means a single attempt.
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Skip and checkpoint a batch that still fails instead of halting.
    pub continue_on_failure: bool,
    /// `None` delivers records one at a time.
    pub batch: Option<BatchPolicy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            max_backoff,
            continue_on_failure: false,
            batch: None,
        }
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn with_batch(mut self, capacity: usize, threshold: Duration) -> Self {
        self.batch = Some(BatchPolicy::new(capacity, threshold));
        self
    }

    /// Records per batch, 1 without a batch policy.
    pub fn batch_capacity(&self) -> usize {
        self.batch.map_or(1, |b| b.capacity)
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based): `backoff * 2^retry`,
    /// capped at `max_backoff`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Periodic timer armed by the runner for a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub name: String,
    pub interval: Duration,
}

impl TimerSpec {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

/// Runtime settings of a topology: concurrency per computation, partitions
/// and codec per stream, plus per computation retry, timers, error stream
/// and consumer group.
#[derive(Clone)]
pub struct Settings {
    default_concurrency: usize,
    default_partitions: u32,
    default_codec: Arc<dyn Codec<Record>>,
    default_retry: RetryPolicy,
    read_timeout: Duration,
    concurrency: HashMap<String, usize>,
    partitions: HashMap<String, u32>,
    codecs: HashMap<String, Arc<dyn Codec<Record>>>,
    retries: HashMap<String, RetryPolicy>,
    timers: HashMap<String, Vec<TimerSpec>>,
    error_streams: HashMap<String, String>,
    groups: HashMap<String, String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("default_concurrency", &self.default_concurrency)
            .field("default_partitions", &self.default_partitions)
            .field("default_codec", &self.default_codec.name())
            .field("default_retry", &self.default_retry)
            .field("read_timeout", &self.read_timeout)
            .field("concurrency", &self.concurrency)
            .field("partitions", &self.partitions)
            .field("retries", &self.retries)
            .field("timers", &self.timers)
            .field("error_streams", &self.error_streams)
            .field("groups", &self.groups)
            .finish()
    }
}

impl Settings {
    pub fn new(default_concurrency: usize, default_partitions: u32) -> Self {
        Self {
            default_concurrency,
            default_partitions,
            default_codec: Arc::new(RecordCodec),
            default_retry: RetryPolicy::default(),
            read_timeout: Duration::from_millis(200),
            concurrency: HashMap::new(),
            partitions: HashMap::new(),
            codecs: HashMap::new(),
            retries: HashMap::new(),
            timers: HashMap::new(),
            error_streams: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec<Record>>) -> Self {
        self.default_codec = codec;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn set_concurrency(mut self, computation: &str, concurrency: usize) -> Self {
        self.concurrency.insert(computation.to_string(), concurrency);
        self
    }

    pub fn set_partitions(mut self, stream: &str, partitions: u32) -> Self {
        self.partitions.insert(stream.to_string(), partitions);
        self
    }

    pub fn set_codec(mut self, stream: &str, codec: Arc<dyn Codec<Record>>) -> Self {
        self.codecs.insert(stream.to_string(), codec);
        self
    }

    pub fn set_retry_policy(mut self, computation: &str, policy: RetryPolicy) -> Self {
        self.retries.insert(computation.to_string(), policy);
        self
    }

    pub fn add_timer(mut self, computation: &str, timer: TimerSpec) -> Self {
        self.timers.entry(computation.to_string()).or_default().push(timer);
        self
    }

    pub fn set_error_stream(mut self, computation: &str, stream: &str) -> Self {
        self.error_streams.insert(computation.to_string(), stream.to_string());
        self
    }

    pub fn set_consumer_group(mut self, computation: &str, group: &str) -> Self {
        self.groups.insert(computation.to_string(), group.to_string());
        self
    }

    pub fn concurrency(&self, computation: &str) -> usize {
        self.concurrency
            .get(computation)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    pub fn partitions(&self, stream: &str) -> u32 {
        self.partitions
            .get(stream)
            .copied()
            .unwrap_or(self.default_partitions)
    }

    pub fn codec(&self, stream: &str) -> Arc<dyn Codec<Record>> {
        self.codecs
            .get(stream)
            .cloned()
            .unwrap_or_else(|| self.default_codec.clone())
    }

    pub fn retry_policy(&self, computation: &str) -> RetryPolicy {
        self.retries
            .get(computation)
            .copied()
            .unwrap_or(self.default_retry)
    }

    pub fn timers(&self, computation: &str) -> &[TimerSpec] {
        self.timers.get(computation).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn error_stream(&self, computation: &str) -> Option<&str> {
        self.error_streams.get(computation).map(String::as_str)
    }

    /// Consumer group of a computation, its name unless configured.
    pub fn consumer_group<'a>(&'a self, computation: &'a str) -> &'a str {
        self.groups
            .get(computation)
            .map(String::as_str)
            .unwrap_or(computation)
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_api::codec::JsonCodec;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn batch_policy_keeps_at_least_one_record() {
        assert_eq!(RetryPolicy::no_retry().batch_capacity(), 1);
        let policy = RetryPolicy::no_retry().with_batch(0, Duration::from_millis(10));
        assert_eq!(policy.batch_capacity(), 1);
        assert!(!policy.continue_on_failure);
        assert!(RetryPolicy::no_retry().with_continue_on_failure(true).continue_on_failure);
    }

    #[test]
    fn overrides_fall_back_to_defaults() {
        let settings = Settings::new(2, 4)
            .set_concurrency("C1", 3)
            .set_partitions("s1", 1)
            .set_codec("s2", Arc::new(JsonCodec::<Record>::new()))
            .set_consumer_group("C2", "shared")
            .add_timer("C1", TimerSpec::new("flush", Duration::from_secs(1)));

        assert_eq!(settings.concurrency("C1"), 3);
        assert_eq!(settings.concurrency("C2"), 2);
        assert_eq!(settings.partitions("s1"), 1);
        assert_eq!(settings.partitions("s9"), 4);
        assert_eq!(settings.codec("s2").name(), "json");
        assert_eq!(settings.codec("s1").name(), "record");
        assert_eq!(settings.consumer_group("C1"), "C1");
        assert_eq!(settings.consumer_group("C2"), "shared");
        assert_eq!(settings.timers("C1").len(), 1);
        assert!(settings.timers("C2").is_empty());
        assert_eq!(settings.retry_policy("C1"), RetryPolicy::default());
    }
}
