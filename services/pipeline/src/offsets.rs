//! Per-partition offset bookkeeping for manual acknowledgment.
//!
//! Messages from one partition may finish out of order (they are processed in
//! different camera lanes). Kafka only stores a single committed position per
//! partition, so a position may advance only across a contiguous run of
//! finished offsets.

use std::collections::{BTreeMap, HashMap};

/// Topic/partition pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// offset -> finished
    pending: BTreeMap<i64, bool>,
    /// Next offset to commit (last finished contiguous offset + 1)
    committable: Option<i64>,
    /// Last position handed out by `take_committable`
    committed: Option<i64>,
}

/// Tracks in-flight offsets and computes commit positions.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<PartitionKey, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched message
    pub fn begin(&mut self, key: &PartitionKey, offset: i64) {
        self.partitions
            .entry(key.clone())
            .or_default()
            .pending
            .insert(offset, false);
    }

    /// Mark a message as acknowledged. Unknown offsets are ignored.
    pub fn complete(&mut self, key: &PartitionKey, offset: i64) {
        let Some(partition) = self.partitions.get_mut(key) else {
            return;
        };

        match partition.pending.get_mut(&offset) {
            Some(done) => *done = true,
            None => return,
        }

        while let Some(entry) = partition.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let (finished, _) = entry.remove_entry();
            partition.committable = Some(finished + 1);
        }
    }

    /// Commit positions that advanced since the last call
    pub fn take_committable(&mut self) -> Vec<(PartitionKey, i64)> {
        let mut out = Vec::new();
        for (key, partition) in self.partitions.iter_mut() {
            if let Some(position) = partition.committable {
                if partition.committed != Some(position) {
                    partition.committed = Some(position);
                    out.push((key.clone(), position));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of dispatched messages not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|p| p.pending.values().filter(|done| !**done).count())
            .sum()
    }

    /// Forget everything, e.g. after the consumer session was rebuilt
    pub fn reset(&mut self) {
        self.partitions.clear();
    }
}
