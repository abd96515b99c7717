use crate::error::StreamError;
use crate::log::{LogOffset, LogPartition};

/// One raw entry of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Raw partitioned append-only byte logs.
///
/// The engine doesn't know concrete implementations, it only sees this trait.
/// Offsets start at 0 per partition and are assigned densely by `append`.
pub trait LogStore: Send + Sync {
    /// Create a log, returns `false` when it already exists (its partition
    /// count is left untouched).
    fn create(&self, name: &str, partitions: u32) -> Result<bool, StreamError>;

    fn exists(&self, name: &str) -> bool;

    /// Returns `false` when the log did not exist.
    fn delete(&self, name: &str) -> Result<bool, StreamError>;

    fn names(&self) -> Vec<String>;

    /// Partition count of a log.
    fn partitions(&self, name: &str) -> Result<u32, StreamError>;

    /// Append bytes at the end of a partition, returns the assigned offset.
    fn append(&self, partition: &LogPartition, bytes: Vec<u8>) -> Result<u64, StreamError>;

    /// Read up to `limit` entries starting at `offset`.
    fn read(&self, partition: &LogPartition, offset: u64, limit: usize) -> Result<Vec<StoredEntry>, StreamError>;

    /// Offset the next append to this partition will get.
    fn end_offset(&self, partition: &LogPartition) -> Result<u64, StreamError>;
}

/// Committed positions per `(group, partition)`.
///
/// Implementations must be linearizable per key and never regress a position
/// on `commit`.
pub trait CheckpointStore: Send + Sync {
    /// Next offset to read for the group, `None` when nothing was committed.
    fn committed(&self, group: &str, partition: &LogPartition) -> Option<u64>;

    /// Store `offset` unless a higher one is already committed.
    /// Returns the value in effect after the call.
    fn commit(&self, group: &str, partition: &LogPartition, offset: u64) -> u64;

    /// Forget the group's positions on every partition of a log.
    fn reset(&self, group: &str, name: &str);

    /// Groups holding at least one position on the log.
    fn groups(&self, name: &str) -> Vec<String>;

    /// Drop every position of a deleted log.
    fn remove_log(&self, name: &str);
}

/// Last durable append of a logical identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEntry {
    pub offset: LogOffset,
    /// SHA-256 of the encoded payload.
    pub digest: [u8; 32],
}

/// Mapping `identity -> last appended offset`, used by idempotent producers.
pub trait IdentityStore: Send + Sync {
    fn get(&self, identity: &str) -> Option<IdentityEntry>;

    /// Run `update` while holding the lock of `identity`, storing what it
    /// returns. When `update` fails nothing is stored.
    fn upsert_with(
        &self,
        identity: &str,
        update: &mut dyn FnMut(Option<&IdentityEntry>) -> Result<IdentityEntry, StreamError>,
    ) -> Result<IdentityEntry, StreamError>;

    fn remove(&self, identity: &str) -> Option<IdentityEntry>;
}
