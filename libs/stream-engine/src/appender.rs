use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use stream_api::StreamError;
use stream_api::codec::Codec;
use stream_api::log::{LogOffset, LogPartition, partition_for_key};

use crate::manager::ManagerShared;

/// Writes messages into the partitions of one log.
pub struct LogAppender<M> {
    shared: Arc<ManagerShared>,
    name: String,
    size: u32,
    codec: Arc<dyn Codec<M>>,
    closed: AtomicBool,
}

impl<M> std::fmt::Debug for LogAppender<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAppender")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl<M> LogAppender<M> {
    pub(crate) fn new(shared: Arc<ManagerShared>, name: String, size: u32, codec: Arc<dyn Codec<M>>) -> Self {
        Self {
            shared,
            name,
            size,
            codec,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition count of the log.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn codec(&self) -> &Arc<dyn Codec<M>> {
        &self.codec
    }

    /// Append to the partition selected by the key.
    pub fn append(&self, key: &str, message: &M) -> Result<LogOffset, StreamError> {
        self.append_to(partition_for_key(key, self.size), message)
    }

    pub fn append_to(&self, partition: u32, message: &M) -> Result<LogOffset, StreamError> {
        let bytes = self.codec.encode(message)?;
        self.append_bytes(partition, bytes)
    }

    /// Append an already encoded message.
    pub(crate) fn append_bytes(&self, partition: u32, bytes: Vec<u8>) -> Result<LogOffset, StreamError> {
        if self.closed() {
            return Err(StreamError::Closed(format!("appender '{}'", self.name)));
        }
        if partition >= self.size {
            return Err(StreamError::InvalidPartition {
                name: self.name.clone(),
                partition,
                size: self.size,
            });
        }
        let partition = LogPartition::of(&self.name, partition);
        let offset = self
            .shared
            .logs
            .append(&partition, bytes)
            .map_err(|e| e.with_context(format!("append to {partition}")))?;
        self.shared.notify_append();
        tracing::trace!(partition = %partition, offset, "appended");
        Ok(LogOffset::new(partition, offset))
    }

    /// Wait until `group` has committed past `offset`.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for(&self, offset: &LogOffset, group: &str, timeout: Duration) -> Result<bool, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut commits = self.shared.subscribe_commits();
        loop {
            if self.closed() {
                return Err(StreamError::Closed(format!("appender '{}'", self.name)));
            }
            let committed = self.shared.checkpoints.committed(group, offset.partition());
            if committed.is_some_and(|c| c > offset.offset()) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = commits.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Closed directly or through its manager.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shared.is_closed()
    }
}
