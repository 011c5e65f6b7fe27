//! Immutable partition-assignment snapshots and their diffs.
//!
//! A snapshot maps each node to the ordered set of partitions of the tracked
//! topic it currently owns. Snapshots arrive whole from the partition
//! tracker; the router replaces its copy atomically and reacts to the diff
//! against the previous one.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{HostPort, TopicPartition};

/// Snapshot of `host → partitions` for one tracked topic.
///
/// A partition appears under at most one host. During a rebalance a
/// partition may be absent entirely; routing to it fails until the next
/// snapshot restores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignments {
    tracked_topic: String,
    by_host: BTreeMap<HostPort, BTreeSet<u32>>,
    by_partition: BTreeMap<u32, HostPort>,
}

/// Assignment changes between two snapshots, keyed by host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    pub added: BTreeMap<HostPort, BTreeSet<u32>>,
    pub revoked: BTreeMap<HostPort, BTreeSet<u32>>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.revoked.is_empty()
    }
}

impl PartitionAssignments {
    /// Build a snapshot from a tracker feed, keeping only partitions of the
    /// tracked topic.
    pub fn new(
        tracked_topic: impl Into<String>,
        assignments: BTreeMap<HostPort, BTreeSet<TopicPartition>>,
    ) -> Self {
        let tracked_topic = tracked_topic.into();
        let mut by_host: BTreeMap<HostPort, BTreeSet<u32>> = BTreeMap::new();
        let mut by_partition = BTreeMap::new();

        for (host, partitions) in assignments {
            let tracked: BTreeSet<u32> = partitions
                .into_iter()
                .filter(|tp| tp.topic.as_ref() == tracked_topic)
                .map(|tp| tp.partition)
                .collect();
            for partition in &tracked {
                by_partition.insert(*partition, host.clone());
            }
            by_host.insert(host, tracked);
        }

        Self {
            tracked_topic,
            by_host,
            by_partition,
        }
    }

    /// Empty snapshot, used before the tracker has reported anything.
    pub fn empty(tracked_topic: impl Into<String>) -> Self {
        Self {
            tracked_topic: tracked_topic.into(),
            by_host: BTreeMap::new(),
            by_partition: BTreeMap::new(),
        }
    }

    pub fn tracked_topic(&self) -> &str {
        &self.tracked_topic
    }

    /// The host a partition is assigned to, if any.
    pub fn owner_of(&self, partition: u32) -> Option<&HostPort> {
        self.by_partition.get(&partition)
    }

    /// Partitions assigned to one host (empty if unknown).
    pub fn partitions_for(&self, host: &HostPort) -> BTreeSet<u32> {
        self.by_host.get(host).cloned().unwrap_or_default()
    }

    /// Every assigned partition, ascending.
    pub fn all_partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_partition.keys().copied()
    }

    pub fn topic_partition(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.tracked_topic.as_str(), partition)
    }

    pub fn is_empty(&self) -> bool {
        self.by_partition.is_empty()
    }

    /// Changes relative to `previous`, keyed by host. A partition that
    /// moved between hosts appears as revoked from one and added to the
    /// other.
    pub fn diff(&self, previous: &PartitionAssignments) -> AssignmentDiff {
        let mut diff = AssignmentDiff::default();

        for (host, current) in &self.by_host {
            let before = previous.partitions_for(host);
            let added: BTreeSet<u32> = current.difference(&before).copied().collect();
            if !added.is_empty() {
                diff.added.insert(host.clone(), added);
            }
            let revoked: BTreeSet<u32> = before.difference(current).copied().collect();
            if !revoked.is_empty() {
                diff.revoked.insert(host.clone(), revoked);
            }
        }
        // Hosts that disappeared entirely lose all of their partitions.
        for (host, before) in &previous.by_host {
            if !self.by_host.contains_key(host) && !before.is_empty() {
                diff.revoked.insert(host.clone(), before.clone());
            }
        }

        diff
    }
}
