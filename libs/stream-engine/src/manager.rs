use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};

use stream_api::codec::Codec;
use stream_api::log::{Latency, LogLag, LogPartition};
use stream_api::storage::{CheckpointStore, LogStore};
use stream_api::{RebalanceListener, StreamError};

use crate::appender::LogAppender;
use crate::group::GroupCoordinator;
use crate::tailer::LogTailer;

/// State shared by a manager and every appender/tailer it created.
pub(crate) struct ManagerShared {
    pub(crate) logs: Arc<dyn LogStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) groups: GroupCoordinator,
    /// Unit signal on every append, wakes waiting tailers.
    notify_tx: broadcast::Sender<()>,
    /// Bumped on every commit, wakes `wait_for` callers.
    commit_tx: watch::Sender<u64>,
    /// log name -> codec of its first appender
    codecs: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn notify_append(&self) {
        // Ignore if no receivers.
        let _ = self.notify_tx.send(());
    }

    pub(crate) fn subscribe_appends(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }

    pub(crate) fn notify_commit(&self) {
        self.commit_tx.send_modify(|c| *c = c.wrapping_add(1));
    }

    pub(crate) fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Record the codec of a log on first use, reject any other one.
    fn check_codec(&self, name: &str, codec: &str, record: bool) -> Result<(), StreamError> {
        let mut codecs = match self.codecs.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("codec registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        match codecs.get(name) {
            Some(expected) if expected != codec => Err(StreamError::InvalidArgument(format!(
                "log '{name}' is written with codec '{expected}', not '{codec}'"
            ))),
            Some(_) => Ok(()),
            None => {
                if record {
                    codecs.insert(name.to_string(), codec.to_string());
                }
                Ok(())
            }
        }
    }

    fn forget_codec(&self, name: &str) {
        match self.codecs.lock() {
            Ok(mut g) => g.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        };
    }

    pub(crate) fn partitions_of(&self, name: &str) -> Result<Vec<LogPartition>, StreamError> {
        let size = self.logs.partitions(name)?;
        Ok((0..size).map(|i| LogPartition::of(name, i)).collect())
    }

    fn check_partition(&self, partition: &LogPartition) -> Result<(), StreamError> {
        let size = self.logs.partitions(partition.name())?;
        if partition.partition() >= size {
            return Err(StreamError::InvalidPartition {
                name: partition.name().to_string(),
                partition: partition.partition(),
                size,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ManagerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerShared")
            .field("logs", &self.logs.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Named partitioned logs over a [`LogStore`], plus the appenders and
/// tailers reading and writing them.
///
/// Cloning is cheap and every clone sees the same logs, groups and
/// checkpoints. `close()` closes every appender and tailer created through
/// any clone.
#[derive(Debug, Clone)]
pub struct LogManager {
    shared: Arc<ManagerShared>,
}

impl LogManager {
    pub fn new(logs: Arc<dyn LogStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        let (commit_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(ManagerShared {
                logs,
                checkpoints,
                groups: GroupCoordinator::new(),
                notify_tx,
                commit_tx,
                codecs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.shared.is_closed() {
            return Err(StreamError::Closed("log manager".into()));
        }
        Ok(())
    }

    fn check_exists(&self, name: &str) -> Result<(), StreamError> {
        if !self.shared.logs.exists(name) {
            return Err(StreamError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Create a log unless it exists. Returns whether it was created.
    pub fn create_if_not_exists(&self, name: &str, partitions: u32) -> Result<bool, StreamError> {
        self.check_open()?;
        let created = self
            .shared
            .logs
            .create(name, partitions)
            .map_err(|e| e.with_context(format!("create log '{name}'")))?;
        if created {
            tracing::info!(log = %name, partitions, "created log");
        }
        Ok(created)
    }

    pub fn exists(&self, name: &str) -> Result<bool, StreamError> {
        self.check_open()?;
        Ok(self.shared.logs.exists(name))
    }

    /// Delete a log and the checkpoints of every group on it.
    pub fn delete(&self, name: &str) -> Result<bool, StreamError> {
        self.check_open()?;
        let deleted = self.shared.logs.delete(name)?;
        if deleted {
            self.shared.checkpoints.remove_log(name);
            self.shared.forget_codec(name);
            tracing::info!(log = %name, "deleted log");
        }
        Ok(deleted)
    }

    pub fn list_all(&self) -> Result<Vec<String>, StreamError> {
        self.check_open()?;
        Ok(self.shared.logs.names())
    }

    /// Partition count of a log.
    pub fn size(&self, name: &str) -> Result<u32, StreamError> {
        self.check_open()?;
        self.shared.logs.partitions(name)
    }

    /// Appender on a log. The first appender fixes the codec of the log,
    /// later ones must use the same.
    pub fn get_appender<M>(&self, name: &str, codec: Arc<dyn Codec<M>>) -> Result<LogAppender<M>, StreamError> {
        self.check_open()?;
        let size = self.shared.logs.partitions(name)?;
        self.shared.check_codec(name, codec.name(), true)?;
        Ok(LogAppender::new(self.shared.clone(), name.to_string(), size, codec))
    }

    /// Tailer bound to explicit partitions (manual assignment).
    ///
    /// Fails with `AlreadyAssigned` while another tailer of the same group
    /// holds one of the partitions.
    pub fn create_tailer<M>(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
        codec: Arc<dyn Codec<M>>,
    ) -> Result<LogTailer<M>, StreamError> {
        self.check_open()?;
        if partitions.is_empty() {
            return Err(StreamError::InvalidArgument("no partition to tail".into()));
        }
        for p in &partitions {
            self.shared.check_partition(p)?;
            self.shared.check_codec(p.name(), codec.name(), false)?;
        }
        LogTailer::manual(self.shared.clone(), group.to_string(), partitions, codec)
    }

    /// Tailer on every partition of a log.
    pub fn create_tailer_for_log<M>(
        &self,
        group: &str,
        name: &str,
        codec: Arc<dyn Codec<M>>,
    ) -> Result<LogTailer<M>, StreamError> {
        self.check_open()?;
        let partitions = self.shared.partitions_of(name)?;
        self.create_tailer(group, partitions, codec)
    }

    /// Tailer whose partitions are assigned dynamically across the members of
    /// `group` reading `names`.
    pub fn subscribe<M>(
        &self,
        group: &str,
        names: &[&str],
        listener: Arc<dyn RebalanceListener>,
        codec: Arc<dyn Codec<M>>,
    ) -> Result<LogTailer<M>, StreamError> {
        self.check_open()?;
        if names.is_empty() {
            return Err(StreamError::InvalidArgument("no log to subscribe to".into()));
        }
        let mut partitions = Vec::new();
        for name in names {
            partitions.extend(self.shared.partitions_of(name)?);
            self.shared.check_codec(name, codec.name(), false)?;
        }
        Ok(LogTailer::subscribed(
            self.shared.clone(),
            group.to_string(),
            partitions,
            listener,
            codec,
        ))
    }

    pub fn get_lag_per_partition(&self, name: &str, group: &str) -> Result<Vec<LogLag>, StreamError> {
        self.check_open()?;
        self.shared
            .partitions_of(name)?
            .iter()
            .map(|p| {
                let end = self.shared.logs.end_offset(p)?;
                Ok(match self.shared.checkpoints.committed(group, p) {
                    Some(committed) => LogLag::of_range(committed, end),
                    None => LogLag::of(end),
                })
            })
            .collect()
    }

    /// Lag of `group` summed over every partition of the log.
    pub fn get_lag(&self, name: &str, group: &str) -> Result<LogLag, StreamError> {
        Ok(LogLag::merge(&self.get_lag_per_partition(name, group)?))
    }

    /// Latency of `group` per partition, using the last committed record of
    /// each partition as reference.
    pub fn get_latency_per_partition<M>(
        &self,
        name: &str,
        group: &str,
        codec: &dyn Codec<M>,
        timestamp_extractor: impl Fn(&M) -> i64,
        key_extractor: impl Fn(&M) -> String,
    ) -> Result<Vec<Latency>, StreamError> {
        let now = stream_api::now_ms();
        let lags = self.get_lag_per_partition(name, group)?;
        let mut latencies = Vec::with_capacity(lags.len());
        for (i, lag) in lags.into_iter().enumerate() {
            let partition = LogPartition::of(name, i as u32);
            let last = match self.shared.checkpoints.committed(group, &partition) {
                Some(committed) if committed > 0 => self.shared.logs.read(&partition, committed - 1, 1)?,
                _ => Vec::new(),
            };
            let latency = match last.first() {
                Some(entry) if lag.lower > 0 && entry.offset == lag.lower - 1 => {
                    let message = codec.decode(&entry.bytes)?;
                    Latency::new(
                        timestamp_extractor(&message),
                        now,
                        lag,
                        Some(key_extractor(&message)),
                    )
                }
                _ => Latency::no_latency(now, lag),
            };
            latencies.push(latency);
        }
        Ok(latencies)
    }

    pub fn get_latency<M>(
        &self,
        name: &str,
        group: &str,
        codec: &dyn Codec<M>,
        timestamp_extractor: impl Fn(&M) -> i64,
        key_extractor: impl Fn(&M) -> String,
    ) -> Result<Latency, StreamError> {
        let latencies =
            self.get_latency_per_partition(name, group, codec, timestamp_extractor, key_extractor)?;
        Ok(Latency::of(&latencies))
    }

    /// Groups having committed at least once on the log.
    pub fn list_consumer_groups(&self, name: &str) -> Result<Vec<String>, StreamError> {
        self.check_open()?;
        self.check_exists(name)?;
        Ok(self.shared.checkpoints.groups(name))
    }

    /// Close the manager and every appender and tailer it created.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.notify_append();
        self.shared.groups.bump();
        tracing::debug!("log manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}
