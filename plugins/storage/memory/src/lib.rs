use std::collections::{BTreeMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use stream_api::StreamError;
use stream_api::log::LogPartition;
use stream_api::storage::{CheckpointStore, IdentityEntry, IdentityStore, LogStore, StoredEntry};

// ═══════════════════════════════════════════════════════════════
//  MemoryStoreConfig
// ═══════════════════════════════════════════════════════════════

fn default_max_records() -> usize {
    0
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryStoreConfig {
    /// Records kept per partition, older ones are dropped (0 = unbounded).
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemLogStore
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct MemPartition {
    /// Offset of `entries[0]`.
    first_offset: u64,
    entries: VecDeque<Vec<u8>>,
}

impl MemPartition {
    fn end_offset(&self) -> u64 {
        self.first_offset + self.entries.len() as u64
    }
}

#[derive(Debug)]
struct MemLog {
    partitions: Vec<RwLock<MemPartition>>,
}

/// In-memory partitioned logs. Each partition is a ring buffer when
/// `max_records` is set; a reader behind the retained range resumes at the
/// oldest retained record.
#[derive(Debug, Default)]
pub struct MemLogStore {
    logs: RwLock<BTreeMap<String, MemLog>>,
    max_records: usize,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &MemoryStoreConfig) -> Self {
        Self {
            logs: RwLock::new(BTreeMap::new()),
            max_records: config.max_records,
        }
    }

    fn logs(&self) -> RwLockReadGuard<'_, BTreeMap<String, MemLog>> {
        match self.logs.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("log store read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn logs_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MemLog>> {
        match self.logs.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("log store write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn with_partition<T>(
        &self,
        partition: &LogPartition,
        f: impl FnOnce(&RwLock<MemPartition>) -> T,
    ) -> Result<T, StreamError> {
        let logs = self.logs();
        let log = logs
            .get(partition.name())
            .ok_or_else(|| StreamError::NotFound(partition.name().to_string()))?;
        let slot = log
            .partitions
            .get(partition.partition() as usize)
            .ok_or_else(|| StreamError::InvalidPartition {
                name: partition.name().to_string(),
                partition: partition.partition(),
                size: log.partitions.len() as u32,
            })?;
        Ok(f(slot))
    }
}

fn read_guard(lock: &RwLock<MemPartition>) -> RwLockReadGuard<'_, MemPartition> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_guard(lock: &RwLock<MemPartition>) -> RwLockWriteGuard<'_, MemPartition> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LogStore for MemLogStore {
    fn create(&self, name: &str, partitions: u32) -> Result<bool, StreamError> {
        if partitions == 0 {
            return Err(StreamError::InvalidArgument(format!(
                "log '{name}' needs at least one partition"
            )));
        }
        let mut logs = self.logs_mut();
        if logs.contains_key(name) {
            return Ok(false);
        }
        let partitions = (0..partitions).map(|_| RwLock::new(MemPartition::default())).collect();
        logs.insert(name.to_string(), MemLog { partitions });
        Ok(true)
    }

    fn exists(&self, name: &str) -> bool {
        self.logs().contains_key(name)
    }

    fn delete(&self, name: &str) -> Result<bool, StreamError> {
        Ok(self.logs_mut().remove(name).is_some())
    }

    fn names(&self) -> Vec<String> {
        self.logs().keys().cloned().collect()
    }

    fn partitions(&self, name: &str) -> Result<u32, StreamError> {
        self.logs()
            .get(name)
            .map(|log| log.partitions.len() as u32)
            .ok_or_else(|| StreamError::NotFound(name.to_string()))
    }

    fn append(&self, partition: &LogPartition, bytes: Vec<u8>) -> Result<u64, StreamError> {
        let max_records = self.max_records;
        self.with_partition(partition, |slot| {
            let mut part = write_guard(slot);
            let offset = part.end_offset();
            part.entries.push_back(bytes);
            if max_records > 0 && part.entries.len() > max_records {
                part.entries.pop_front();
                part.first_offset += 1;
            }
            offset
        })
    }

    fn read(&self, partition: &LogPartition, offset: u64, limit: usize) -> Result<Vec<StoredEntry>, StreamError> {
        self.with_partition(partition, |slot| {
            let part = read_guard(slot);
            let start = offset.max(part.first_offset);
            let skip = (start - part.first_offset) as usize;
            part.entries
                .iter()
                .skip(skip)
                .take(limit)
                .enumerate()
                .map(|(i, bytes)| StoredEntry {
                    offset: start + i as u64,
                    bytes: bytes.clone(),
                })
                .collect()
        })
    }

    fn end_offset(&self, partition: &LogPartition) -> Result<u64, StreamError> {
        self.with_partition(partition, |slot| read_guard(slot).end_offset())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemCheckpointStore
// ═══════════════════════════════════════════════════════════════

/// Committed offsets, sharded per `(group, partition)`.
#[derive(Debug, Default)]
pub struct MemCheckpointStore {
    offsets: DashMap<(String, LogPartition), u64>,
}

impl MemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemCheckpointStore {
    fn committed(&self, group: &str, partition: &LogPartition) -> Option<u64> {
        self.offsets
            .get(&(group.to_string(), partition.clone()))
            .map(|v| *v)
    }

    fn commit(&self, group: &str, partition: &LogPartition, offset: u64) -> u64 {
        let mut entry = self
            .offsets
            .entry((group.to_string(), partition.clone()))
            .or_insert(offset);
        if offset < *entry {
            tracing::debug!(
                group,
                partition = %partition,
                committed = *entry,
                requested = offset,
                "ignoring checkpoint regression"
            );
        } else {
            *entry = offset;
        }
        *entry
    }

    fn reset(&self, group: &str, name: &str) {
        self.offsets
            .retain(|(g, p), _| !(g == group && p.name() == name));
    }

    fn groups(&self, name: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .offsets
            .iter()
            .filter(|e| e.key().1.name() == name)
            .map(|e| e.key().0.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    fn remove_log(&self, name: &str) {
        self.offsets.retain(|(_, p), _| p.name() != name);
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemIdentityStore
// ═══════════════════════════════════════════════════════════════

/// Identity -> last appended offset, locked per entry.
#[derive(Debug, Default)]
pub struct MemIdentityStore {
    entries: DashMap<String, IdentityEntry>,
}

impl MemIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityStore for MemIdentityStore {
    fn get(&self, identity: &str) -> Option<IdentityEntry> {
        self.entries.get(identity).map(|e| e.clone())
    }

    fn upsert_with(
        &self,
        identity: &str,
        update: &mut dyn FnMut(Option<&IdentityEntry>) -> Result<IdentityEntry, StreamError>,
    ) -> Result<IdentityEntry, StreamError> {
        match self.entries.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let next = update(Some(occupied.get()))?;
                occupied.insert(next.clone());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                let next = update(None)?;
                vacant.insert(next.clone());
                Ok(next)
            }
        }
    }

    fn remove(&self, identity: &str) -> Option<IdentityEntry> {
        self.entries.remove(identity).map(|(_, e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_api::log::LogOffset;

    fn p(name: &str, partition: u32) -> LogPartition {
        LogPartition::of(name, partition)
    }

    #[test]
    fn create_keeps_existing_partition_count() {
        let store = MemLogStore::new();
        assert!(store.create("s1", 3).unwrap());
        assert!(!store.create("s1", 7).unwrap());
        assert_eq!(store.partitions("s1").unwrap(), 3);
        assert!(matches!(store.create("s2", 0), Err(StreamError::InvalidArgument(_))));
        assert!(matches!(store.partitions("nope"), Err(StreamError::NotFound(_))));
    }

    #[test]
    fn offsets_are_dense_per_partition() {
        let store = MemLogStore::new();
        store.create("s1", 2).unwrap();
        assert_eq!(store.append(&p("s1", 0), b"a".to_vec()).unwrap(), 0);
        assert_eq!(store.append(&p("s1", 0), b"b".to_vec()).unwrap(), 1);
        assert_eq!(store.append(&p("s1", 1), b"c".to_vec()).unwrap(), 0);

        let read = store.read(&p("s1", 0), 1, 10).unwrap();
        assert_eq!(read, vec![StoredEntry { offset: 1, bytes: b"b".to_vec() }]);
        assert_eq!(store.end_offset(&p("s1", 0)).unwrap(), 2);
        assert!(matches!(
            store.append(&p("s1", 2), vec![]),
            Err(StreamError::InvalidPartition { size: 2, .. })
        ));
    }

    #[test]
    fn retention_drops_oldest_records() {
        let store = MemLogStore::with_config(&MemoryStoreConfig { max_records: 2 });
        store.create("s1", 1).unwrap();
        for b in [b"a", b"b", b"c"] {
            store.append(&p("s1", 0), b.to_vec()).unwrap();
        }
        let read = store.read(&p("s1", 0), 0, 10).unwrap();
        assert_eq!(read.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.end_offset(&p("s1", 0)).unwrap(), 3);
    }

    #[test]
    fn checkpoints_never_regress() {
        let store = MemCheckpointStore::new();
        assert_eq!(store.committed("g", &p("s1", 0)), None);
        assert_eq!(store.commit("g", &p("s1", 0), 5), 5);
        assert_eq!(store.commit("g", &p("s1", 0), 3), 5);
        assert_eq!(store.committed("g", &p("s1", 0)), Some(5));

        store.commit("other", &p("s1", 1), 1);
        assert_eq!(store.groups("s1"), vec!["g".to_string(), "other".to_string()]);

        store.reset("g", "s1");
        assert_eq!(store.committed("g", &p("s1", 0)), None);
        assert_eq!(store.committed("other", &p("s1", 1)), Some(1));

        store.remove_log("s1");
        assert!(store.groups("s1").is_empty());
    }

    #[test]
    fn failed_identity_update_stores_nothing() {
        let store = MemIdentityStore::new();
        let res = store.upsert_with("id", &mut |_| Err(StreamError::Store("boom".into())));
        assert!(res.is_err());
        assert!(store.get("id").is_none());

        let entry = IdentityEntry {
            offset: LogOffset::new(p("s1", 0), 4),
            digest: [7; 32],
        };
        let stored = store
            .upsert_with("id", &mut |prev| {
                assert!(prev.is_none());
                Ok(entry.clone())
            })
            .unwrap();
        assert_eq!(stored, entry);
        assert_eq!(store.remove("id"), Some(entry));
        assert!(store.is_empty());
    }
}
