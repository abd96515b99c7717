use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use stream_api::StreamError;
use stream_api::log::LogPartition;

pub(crate) type MemberId = u64;

#[derive(Debug, Default)]
struct GroupState {
    /// Subscribed members per group, with the partitions of the logs they read.
    members: HashMap<String, BTreeMap<MemberId, Vec<LogPartition>>>,
    /// Current owner of each `(group, partition)`, manual or subscribed.
    owners: HashMap<(String, LogPartition), MemberId>,
}

/// Partition ownership for every consumer group of a manager.
///
/// Subscribed members converge toward a target assignment: each member
/// gives up what it no longer targets (after committing it) and picks up a
/// targeted partition only once nobody owns it. Every membership or
/// ownership change bumps a generation watched by the tailers.
#[derive(Debug)]
pub(crate) struct GroupCoordinator {
    state: Mutex<GroupState>,
    generation: watch::Sender<u64>,
    next_member: AtomicU64,
}

impl GroupCoordinator {
    pub(crate) fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(GroupState::default()),
            generation,
            next_member: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("group state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub(crate) fn next_member_id(&self) -> MemberId {
        self.next_member.fetch_add(1, Ordering::Relaxed)
    }

    /// Take every partition or none of them.
    pub(crate) fn acquire_all(
        &self,
        group: &str,
        member: MemberId,
        partitions: &[LogPartition],
    ) -> Result<(), StreamError> {
        let mut state = self.state();
        if let Some(taken) = partitions
            .iter()
            .find(|p| state.owners.contains_key(&(group.to_string(), (*p).clone())))
        {
            return Err(StreamError::AlreadyAssigned {
                group: group.to_string(),
                partition: taken.clone(),
            });
        }
        for p in partitions {
            state.owners.insert((group.to_string(), p.clone()), member);
        }
        Ok(())
    }

    pub(crate) fn join(&self, group: &str, member: MemberId, partitions: Vec<LogPartition>) {
        self.state()
            .members
            .entry(group.to_string())
            .or_default()
            .insert(member, partitions);
        tracing::debug!(group, member, "member joined");
        self.bump();
    }

    /// Drop the membership and every partition the member owns.
    pub(crate) fn leave(&self, group: &str, member: MemberId) {
        {
            let mut state = self.state();
            let emptied = match state.members.get_mut(group) {
                Some(members) => {
                    members.remove(&member);
                    members.is_empty()
                }
                None => false,
            };
            if emptied {
                state.members.remove(group);
            }
            state.owners.retain(|(g, _), owner| !(g == group && *owner == member));
        }
        tracing::debug!(group, member, "member left");
        self.bump();
    }

    pub(crate) fn release(&self, group: &str, member: MemberId, partitions: &[LogPartition]) {
        {
            let mut state = self.state();
            for p in partitions {
                let key = (group.to_string(), p.clone());
                if state.owners.get(&key) == Some(&member) {
                    state.owners.remove(&key);
                }
            }
        }
        self.bump();
    }

    pub(crate) fn try_acquire(&self, group: &str, member: MemberId, partition: &LogPartition) -> bool {
        let mut state = self.state();
        let key = (group.to_string(), partition.clone());
        match state.owners.get(&key) {
            Some(owner) => *owner == member,
            None => {
                state.owners.insert(key, member);
                true
            }
        }
    }

    /// Partitions the member should own once the group has converged.
    ///
    /// All partitions read by the group, sorted, dealt round-robin over the
    /// members (sorted by id) that subscribed to their log.
    pub(crate) fn target(&self, group: &str, member: MemberId) -> BTreeSet<LogPartition> {
        let state = self.state();
        let mut target = BTreeSet::new();
        let Some(members) = state.members.get(group) else {
            return target;
        };
        let all: BTreeSet<&LogPartition> = members.values().flatten().collect();
        for (i, p) in all.into_iter().enumerate() {
            let eligible: Vec<MemberId> = members
                .iter()
                .filter(|(_, parts)| parts.contains(p))
                .map(|(id, _)| *id)
                .collect();
            if eligible[i % eligible.len()] == member {
                target.insert(p.clone());
            }
        }
        target
    }
}
