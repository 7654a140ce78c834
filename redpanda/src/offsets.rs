//! Commit positions for concurrently processed messages.
//!
//! Kafka commits a single position per partition, and committing offset `n`
//! settles everything below it. Messages are acknowledged out of order when
//! they are processed concurrently, so the committable position is the
//! lowest offset still in flight, or one past the highest acknowledged offset
//! once nothing is in flight.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_acknowledged: Option<i64>,
    committed: Option<i64>,
}

/// Delivered but unacknowledged offsets, per topic partition.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Records a message handed to the subscriber.
    pub(crate) fn delivered(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Records an acknowledgement and returns the position to commit, if it
    /// moved forward. Unknown or repeated acknowledgements return `None`.
    pub(crate) fn acknowledged(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }

        let highest = state.highest_acknowledged.map_or(offset, |h| h.max(offset));
        state.highest_acknowledged = Some(highest);

        let next = state.in_flight.first().copied().unwrap_or(highest + 1);
        if state.committed.is_some_and(|committed| committed >= next) {
            return None;
        }
        state.committed = Some(next);
        Some(next)
    }

    /// Number of messages delivered and not yet acknowledged.
    pub(crate) fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }
}
