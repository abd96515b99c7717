use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use stream_api::codec::Codec;
use stream_api::log::{LogOffset, LogPartition, LogRecord};
use stream_api::{RebalanceListener, StreamError};

use crate::group::MemberId;
use crate::manager::ManagerShared;

/// Upper bound between two polls of the store while waiting for records.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Assignment {
    Manual,
    Subscribed { listener: Arc<dyn RebalanceListener> },
}

/// Sequential reader of one or more partitions under a consumer group.
///
/// Reads are in offset order within a partition, partitions are visited
/// round-robin. Positions only become durable on `commit`.
pub struct LogTailer<M> {
    shared: Arc<ManagerShared>,
    group: String,
    member: MemberId,
    codec: Arc<dyn Codec<M>>,
    assignment: Assignment,
    assignments: Vec<LogPartition>,
    positions: HashMap<LogPartition, u64>,
    paused: HashSet<LogPartition>,
    cursor: usize,
    appends: broadcast::Receiver<()>,
    generation: watch::Receiver<u64>,
    closed: bool,
}

impl<M> std::fmt::Debug for LogTailer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailer")
            .field("group", &self.group)
            .field("member", &self.member)
            .field("assignments", &self.assignments)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<M> LogTailer<M> {
    pub(crate) fn manual(
        shared: Arc<ManagerShared>,
        group: String,
        partitions: Vec<LogPartition>,
        codec: Arc<dyn Codec<M>>,
    ) -> Result<Self, StreamError> {
        let member = shared.groups.next_member_id();
        shared.groups.acquire_all(&group, member, &partitions)?;
        let mut tailer = Self::new(shared, group, member, codec, Assignment::Manual);
        for p in partitions {
            tailer.add_assignment(p);
        }
        tracing::debug!(group = %tailer.group, assignments = ?tailer.assignments, "tailer created");
        Ok(tailer)
    }

    pub(crate) fn subscribed(
        shared: Arc<ManagerShared>,
        group: String,
        partitions: Vec<LogPartition>,
        listener: Arc<dyn RebalanceListener>,
        codec: Arc<dyn Codec<M>>,
    ) -> Self {
        let member = shared.groups.next_member_id();
        // Subscribe to notifications before joining so no bump is missed.
        let tailer = Self::new(shared, group, member, codec, Assignment::Subscribed { listener });
        tailer.shared.groups.join(&tailer.group, member, partitions);
        tracing::debug!(group = %tailer.group, member, "tailer subscribed");
        tailer
    }

    fn new(
        shared: Arc<ManagerShared>,
        group: String,
        member: MemberId,
        codec: Arc<dyn Codec<M>>,
        assignment: Assignment,
    ) -> Self {
        let appends = shared.subscribe_appends();
        let generation = shared.groups.watch();
        Self {
            shared,
            group,
            member,
            codec,
            assignment,
            assignments: Vec::new(),
            positions: HashMap::new(),
            paused: HashSet::new(),
            cursor: 0,
            appends,
            generation,
            closed: false,
        }
    }

    fn add_assignment(&mut self, partition: LogPartition) {
        let start = self.committed_or_zero(&partition);
        self.positions.insert(partition.clone(), start);
        self.assignments.push(partition);
    }

    fn committed_or_zero(&self, partition: &LogPartition) -> u64 {
        self.shared.checkpoints.committed(&self.group, partition).unwrap_or(0)
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.closed() {
            return Err(StreamError::Closed(format!("tailer of group '{}'", self.group)));
        }
        Ok(())
    }

    fn check_assigned(&self, partition: &LogPartition) -> Result<(), StreamError> {
        if !self.positions.contains_key(partition) {
            return Err(StreamError::NotAssigned(partition.clone()));
        }
        Ok(())
    }

    /// Read the next record, waiting up to `timeout`.
    ///
    /// `Ok(None)` on timeout. A record that cannot be decoded is reported as
    /// `StreamError::Decode` and skipped, the next read continues after it.
    pub async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord<M>>, StreamError> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            if matches!(self.assignment, Assignment::Subscribed { .. }) {
                self.rebalance()?;
            }
            if let Some(record) = self.poll()? {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            tokio::select! {
                // Lagged receivers just re-poll.
                _ = self.appends.recv() => {}
                _ = self.generation.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            self.check_open()?;
        }
    }

    /// One pass over the assigned partitions, starting after the last one read.
    fn poll(&mut self) -> Result<Option<LogRecord<M>>, StreamError> {
        let count = self.assignments.len();
        for step in 0..count {
            let idx = (self.cursor + step) % count;
            let partition = &self.assignments[idx];
            if self.paused.contains(partition) {
                continue;
            }
            let position = self.positions.get(partition).copied().unwrap_or(0);
            let Some(entry) = self.shared.logs.read(partition, position, 1)?.into_iter().next() else {
                continue;
            };
            let partition = partition.clone();
            self.positions.insert(partition.clone(), entry.offset + 1);
            self.cursor = (idx + 1) % count;
            let offset = LogOffset::new(partition, entry.offset);
            return match self.codec.decode(&entry.bytes) {
                Ok(message) => Ok(Some(LogRecord::new(message, offset))),
                Err(source) => Err(StreamError::Decode { offset, source }),
            };
        }
        Ok(None)
    }

    /// Converge toward the group's target assignment.
    ///
    /// Revoked partitions are handed to the listener, committed, then
    /// released. New partitions are taken only once free and start at their
    /// committed offset.
    fn rebalance(&mut self) -> Result<(), StreamError> {
        let Assignment::Subscribed { listener } = &self.assignment else {
            return Ok(());
        };
        let listener = listener.clone();
        let target = self.shared.groups.target(&self.group, self.member);
        let owned: BTreeSet<LogPartition> = self.assignments.iter().cloned().collect();

        let revoked: Vec<LogPartition> = owned.difference(&target).cloned().collect();
        if !revoked.is_empty() {
            listener.on_partitions_revoked(&revoked)?;
            for p in &revoked {
                if let Some(position) = self.positions.remove(p) {
                    let position = listener.unprocessed_offset(p).map_or(position, |o| o.min(position));
                    self.shared.checkpoints.commit(&self.group, p, position);
                }
                self.paused.remove(p);
            }
            self.assignments.retain(|p| !revoked.contains(p));
            self.cursor = 0;
            self.shared.notify_commit();
            self.shared.groups.release(&self.group, self.member, &revoked);
            tracing::info!(group = %self.group, member = self.member, revoked = ?revoked, "partitions revoked");
        }

        let mut assigned = Vec::new();
        for p in target.difference(&owned) {
            if self.shared.groups.try_acquire(&self.group, self.member, p) {
                self.add_assignment(p.clone());
                assigned.push(p.clone());
            }
        }
        if !assigned.is_empty() {
            self.assignments.sort();
            tracing::info!(group = %self.group, member = self.member, assigned = ?assigned, "partitions assigned");
            listener.on_partitions_assigned(&assigned);
        }
        Ok(())
    }

    /// Commit the current position of every assigned partition.
    pub fn commit(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        for p in &self.assignments {
            if let Some(position) = self.positions.get(p) {
                self.shared.checkpoints.commit(&self.group, p, *position);
            }
        }
        self.shared.notify_commit();
        tracing::trace!(group = %self.group, "committed");
        Ok(())
    }

    pub fn commit_partition(&mut self, partition: &LogPartition) -> Result<LogOffset, StreamError> {
        self.check_open()?;
        self.check_assigned(partition)?;
        let position = self.positions.get(partition).copied().unwrap_or(0);
        let committed = self.shared.checkpoints.commit(&self.group, partition, position);
        self.shared.notify_commit();
        Ok(LogOffset::new(partition.clone(), committed))
    }

    pub fn to_start(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        for position in self.positions.values_mut() {
            *position = 0;
        }
        Ok(())
    }

    pub fn to_end(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        for p in &self.assignments {
            let end = self.shared.logs.end_offset(p)?;
            self.positions.insert(p.clone(), end);
        }
        Ok(())
    }

    pub fn to_last_committed(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        for p in self.assignments.clone() {
            let committed = self.committed_or_zero(&p);
            self.positions.insert(p, committed);
        }
        Ok(())
    }

    /// Move the position of an assigned partition.
    pub fn seek(&mut self, offset: &LogOffset) -> Result<(), StreamError> {
        self.check_open()?;
        self.check_assigned(offset.partition())?;
        self.positions.insert(offset.partition().clone(), offset.offset());
        Ok(())
    }

    /// Drop the group's checkpoints on the assigned logs and rewind to the start.
    pub fn reset(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        let names: BTreeSet<&str> = self.assignments.iter().map(|p| p.name()).collect();
        for name in names {
            self.shared.checkpoints.reset(&self.group, name);
        }
        for position in self.positions.values_mut() {
            *position = 0;
        }
        tracing::info!(group = %self.group, "tailer reset");
        Ok(())
    }

    /// Stop reading a partition until `resume`.
    pub fn pause(&mut self, partition: &LogPartition) -> Result<(), StreamError> {
        self.check_assigned(partition)?;
        self.paused.insert(partition.clone());
        Ok(())
    }

    pub fn resume(&mut self, partition: &LogPartition) -> Result<(), StreamError> {
        self.check_assigned(partition)?;
        self.paused.remove(partition);
        Ok(())
    }

    pub fn paused(&self) -> Vec<LogPartition> {
        let mut paused: Vec<LogPartition> = self.paused.iter().cloned().collect();
        paused.sort();
        paused
    }

    pub fn assignments(&self) -> &[LogPartition] {
        &self.assignments
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Release the partitions without committing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.assignment {
            Assignment::Manual => {
                self.shared.groups.release(&self.group, self.member, &self.assignments);
            }
            Assignment::Subscribed { .. } => self.shared.groups.leave(&self.group, self.member),
        }
        self.assignments.clear();
        self.positions.clear();
        self.paused.clear();
        tracing::debug!(group = %self.group, member = self.member, "tailer closed");
    }

    /// Closed directly or through its manager.
    pub fn closed(&self) -> bool {
        self.closed || self.shared.is_closed()
    }
}

impl<M> Drop for LogTailer<M> {
    fn drop(&mut self) {
        self.close();
    }
}
