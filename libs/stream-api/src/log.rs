use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

/// One partition of a named log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPartition {
    name: String,
    partition: u32,
}

impl LogPartition {
    pub fn of(name: impl Into<String>, partition: u32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for LogPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.name, self.partition)
    }
}

/// Partition selected for `key` in a log of `size` partitions.
///
/// SipHash-1-3 with zero keys: the mapping is identical across processes
/// and releases, which is what keeps per-key ordering across restarts.
pub fn partition_for_key(key: &str, size: u32) -> u32 {
    if size <= 1 {
        return 0;
    }
    let mut hasher = SipHasher13::new();
    hasher.write(key.as_bytes());
    (hasher.finish() % u64::from(size)) as u32
}

/// Position of a record in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogOffset {
    partition: LogPartition,
    offset: u64,
}

impl LogOffset {
    pub fn new(partition: LogPartition, offset: u64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &LogPartition {
        &self.partition
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the record right after this one.
    pub fn next(&self) -> LogOffset {
        LogOffset::new(self.partition.clone(), self.offset + 1)
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:+{}", self.partition, self.offset)
    }
}

/// A decoded message together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<M> {
    message: M,
    offset: LogOffset,
}

impl<M> LogRecord<M> {
    pub fn new(message: M, offset: LogOffset) -> Self {
        Self { message, offset }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn offset(&self) -> &LogOffset {
        &self.offset
    }
}

/// Distance between a consumer group's committed position and the end of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LogLag {
    /// Committed offset (next record the group will read).
    pub lower: u64,
    /// End offset (next offset to be written).
    pub upper: u64,
    pub lag: u64,
}

impl LogLag {
    /// Lag of a group that never committed on a log holding `lag` records.
    pub fn of(lag: u64) -> Self {
        Self {
            lower: 0,
            upper: lag,
            lag,
        }
    }

    pub fn of_range(lower: u64, upper: u64) -> Self {
        Self {
            lower,
            upper,
            lag: upper.saturating_sub(lower),
        }
    }

    /// Sum the lags of several partitions.
    pub fn merge(lags: &[LogLag]) -> Self {
        lags.iter().fold(LogLag::default(), |acc, l| LogLag {
            lower: acc.lower + l.lower,
            upper: acc.upper + l.upper,
            lag: acc.lag + l.lag,
        })
    }
}

impl fmt::Display for LogLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lag: {}, pos: {}, end: {}", self.lag, self.lower, self.upper)
    }
}

/// Processing latency derived from the last committed record of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Latency {
    /// Event time of the last committed record, 0 when nothing was committed.
    pub lower_ms: i64,
    /// Time at which the latency was measured.
    pub upper_ms: i64,
    /// `upper_ms - lower_ms` when there is lag, 0 otherwise.
    pub latency_ms: i64,
    pub lag: LogLag,
    /// Key of the last committed record.
    pub key: Option<String>,
}

impl Latency {
    pub fn new(lower_ms: i64, upper_ms: i64, lag: LogLag, key: Option<String>) -> Self {
        let latency_ms = if lag.lag > 0 && lower_ms > 0 {
            (upper_ms - lower_ms).max(0)
        } else {
            0
        };
        Self {
            lower_ms,
            upper_ms,
            latency_ms,
            lag,
            key,
        }
    }

    pub fn no_latency(upper_ms: i64, lag: LogLag) -> Self {
        Self::new(0, upper_ms, lag, None)
    }

    /// Aggregate partitions: worst latency wins, lags are summed.
    pub fn of(latencies: &[Latency]) -> Latency {
        let lag = LogLag::merge(&latencies.iter().map(|l| l.lag).collect::<Vec<_>>());
        let worst = latencies
            .iter()
            .filter(|l| l.lag.lag > 0)
            .max_by_key(|l| l.latency_ms);
        match worst {
            Some(w) => Latency {
                lower_ms: w.lower_ms,
                upper_ms: w.upper_ms,
                latency_ms: w.latency_ms,
                lag,
                key: w.key.clone(),
            },
            None => {
                let upper_ms = latencies.iter().map(|l| l.upper_ms).max().unwrap_or(0);
                Latency::no_latency(upper_ms, lag)
            }
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "latency: {}ms, {}", self.latency_ms, self.lag)?;
        if let Some(key) = &self.key {
            write!(f, ", key: {key}")?;
        }
        Ok(())
    }
}
