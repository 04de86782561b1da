//! Per-partition commit watermarks
//!
//! Every routed record is tracked with the number of mutations still owed
//! for it. A record is resolved once those mutations are acked (or at once
//! when it produced none). The watermark of a partition is the highest offset
//! at or below which every tracked record is resolved; it only moves forward.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

use crate::mutation::RecordRef;
use crate::record::TopicPartition;

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Unresolved offsets and the mutations still owed for each
    pending: BTreeMap<u64, usize>,
    lowest_tracked: Option<u64>,
    highest_tracked: Option<u64>,
    watermark: Option<u64>,
}

impl PartitionOffsets {
    fn advance(&mut self) {
        let candidate = match self.pending.keys().next() {
            Some(&first_pending) => first_pending.checked_sub(1),
            None => self.highest_tracked,
        };
        // offsets below the first tracked record were never seen here
        let candidate = candidate.filter(|&c| self.lowest_tracked.is_some_and(|low| c >= low));

        if candidate > self.watermark {
            self.watermark = candidate;
        }
    }
}

/// Tracks which source offsets are safe to commit
#[derive(Debug, Default)]
pub struct OffsetCoordinator {
    partitions: RwLock<HashMap<TopicPartition, PartitionOffsets>>,
}

impl OffsetCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record owing `pending` mutations; zero resolves it at once
    pub fn track(&self, record: &RecordRef, pending: usize) {
        let mut partitions = self.partitions.write();
        let state = partitions
            .entry(record.topic_partition.clone())
            .or_default();

        state.lowest_tracked = Some(
            state
                .lowest_tracked
                .map_or(record.offset, |low| low.min(record.offset)),
        );
        state.highest_tracked = Some(
            state
                .highest_tracked
                .map_or(record.offset, |high| high.max(record.offset)),
        );
        if pending > 0 {
            *state.pending.entry(record.offset).or_insert(0) += pending;
        }
        state.advance();

        trace!(record = %record, pending, "Tracked record");
    }

    /// Resolve one owed mutation for each record
    pub fn ack(&self, records: &[RecordRef]) {
        let mut partitions = self.partitions.write();
        for record in records {
            let Some(state) = partitions.get_mut(&record.topic_partition) else {
                debug!(record = %record, "Ack for untracked partition ignored");
                continue;
            };
            match state.pending.get_mut(&record.offset) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.pending.remove(&record.offset);
                }
                None => debug!(record = %record, "Ack for unresolved offset ignored"),
            }
        }
        for state in partitions.values_mut() {
            state.advance();
        }
    }

    /// Highest committable offset (inclusive) of a partition
    pub fn watermark(&self, partition: &TopicPartition) -> Option<u64> {
        self.partitions
            .read()
            .get(partition)
            .and_then(|state| state.watermark)
    }

    /// Inclusive watermark of every partition that has one
    pub fn watermarks(&self) -> HashMap<TopicPartition, u64> {
        self.partitions
            .read()
            .iter()
            .filter_map(|(tp, state)| state.watermark.map(|w| (tp.clone(), w)))
            .collect()
    }

    /// Next offset to consume per partition (`watermark + 1`), the value a
    /// consumer group commits
    pub fn commit_offsets(&self) -> HashMap<TopicPartition, u64> {
        self.watermarks()
            .into_iter()
            .map(|(tp, w)| (tp, w + 1))
            .collect()
    }

    /// Records of a partition not yet resolved
    pub fn pending(&self, partition: &TopicPartition) -> usize {
        self.partitions
            .read()
            .get(partition)
            .map_or(0, |state| state.pending.len())
    }

    /// Unresolved records across all partitions
    pub fn total_pending(&self) -> usize {
        self.partitions
            .read()
            .values()
            .map(|state| state.pending.len())
            .sum()
    }

    /// Forget a partition, e.g. after it was revoked from this task
    pub fn reset(&self, partition: &TopicPartition) {
        if self.partitions.write().remove(partition).is_some() {
            debug!(partition = %partition, "Reset partition offsets");
        }
    }
}
