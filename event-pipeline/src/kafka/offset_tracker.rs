//! Offset Tracker - Tracks the committable offset and rewind epoch per partition
//!
//! Partition workers mark the next offset that is safe to commit after each batch:
//! `max_offset + 1` when every record was acknowledged, or the lowest failed offset
//! when some records must be redelivered. The consumer commits these periodically.
//!
//! The rewind epoch counts how many times a partition was seeked back. Batches are
//! stamped with the epoch at routing time so a worker can recognise batches that were
//! read before the seek and must not be processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::kafka::types::Partition;

#[derive(Error, Debug)]
pub enum OffsetTrackerError {
    /// A rebalance is currently in progress - commits should be skipped
    #[error("Rebalance in progress - offset commits should be skipped")]
    RebalanceInProgress,
}

#[derive(Debug, Default)]
struct PartitionState {
    /// The next offset to consume once everything before it is acknowledged.
    processed_offset: Option<i64>,
    /// Offset last committed to Kafka for this partition.
    committed_offset: Option<i64>,
    rewind_epoch: u64,
}

#[derive(Default)]
pub struct OffsetTracker {
    partition_state: DashMap<Partition, PartitionState>,
    /// When true, offset commits should be skipped to avoid committing during rebalancing
    rebalancing: AtomicBool,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(rebalancing, "Offset tracker rebalancing state changed");
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Record that everything before `next_offset` is acknowledged.
    ///
    /// Only advances, never goes backwards.
    pub fn mark_processed(&self, partition: &Partition, next_offset: i64) {
        let mut state = self.partition_state.entry(partition.clone()).or_default();

        match state.processed_offset {
            Some(current) if next_offset <= current => {}
            previous => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    previous_offset = ?previous,
                    new_offset = next_offset,
                    "Advancing processed offset"
                );
                state.processed_offset = Some(next_offset);
            }
        }
    }

    /// Snapshot of offsets that are safe to commit.
    ///
    /// # Errors
    ///
    /// Returns `OffsetTrackerError::RebalanceInProgress` while a rebalance is running.
    pub fn get_committable_offsets(&self) -> Result<HashMap<Partition, i64>, OffsetTrackerError> {
        if self.is_rebalancing() {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self
            .partition_state
            .iter()
            .filter_map(|entry| {
                let state = entry.value();
                match (state.processed_offset, state.committed_offset) {
                    (Some(processed), Some(committed)) if processed <= committed => None,
                    (Some(processed), _) => Some((entry.key().clone(), processed)),
                    (None, _) => None,
                }
            })
            .collect())
    }

    /// Remember what was committed so unchanged partitions are not committed again.
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partition_state.get_mut(partition) {
                state.committed_offset = Some(*offset);
            }
        }
    }

    pub fn get_partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|state| state.processed_offset)
    }

    pub fn get_committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|state| state.committed_offset)
    }

    /// Current rewind epoch of `partition`, stamped on every batch routed to its worker.
    pub fn rewind_epoch(&self, partition: &Partition) -> u64 {
        self.partition_state
            .get(partition)
            .map(|state| state.rewind_epoch)
            .unwrap_or_default()
    }

    /// Called by the consumer once a seek for `partition` went through. Batches routed
    /// from now on carry the new epoch.
    pub fn advance_rewind_epoch(&self, partition: &Partition) -> u64 {
        let mut state = self.partition_state.entry(partition.clone()).or_default();
        state.rewind_epoch += 1;
        state.rewind_epoch
    }

    /// Clear all tracking for a partition (during revocation)
    pub fn clear_partition(&self, partition: &Partition) {
        if self.partition_state.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn test_mark_processed_initializes_offset() {
        let tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark_processed(&partition, 100);

        assert_eq!(tracker.get_partition_offset(&partition), Some(100));
    }

    #[test]
    fn test_mark_processed_never_goes_backwards() {
        let tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark_processed(&partition, 100);
        tracker.mark_processed(&partition, 50);
        assert_eq!(tracker.get_partition_offset(&partition), Some(100));

        tracker.mark_processed(&partition, 150);
        assert_eq!(tracker.get_partition_offset(&partition), Some(150));
    }

    #[test]
    fn test_commits_skipped_while_rebalancing() {
        let tracker = OffsetTracker::new();
        tracker.mark_processed(&test_partition(0), 10);

        tracker.set_rebalancing(true);
        assert!(matches!(
            tracker.get_committable_offsets(),
            Err(OffsetTrackerError::RebalanceInProgress)
        ));

        tracker.set_rebalancing(false);
        let offsets = tracker.get_committable_offsets().unwrap();
        assert_eq!(offsets.get(&test_partition(0)), Some(&10));
    }

    #[test]
    fn test_committed_partitions_are_not_recommitted() {
        let tracker = OffsetTracker::new();
        tracker.mark_processed(&test_partition(0), 10);
        tracker.mark_processed(&test_partition(1), 20);

        let offsets = tracker.get_committable_offsets().unwrap();
        assert_eq!(offsets.len(), 2);
        tracker.mark_committed(&offsets);

        assert!(tracker.get_committable_offsets().unwrap().is_empty());
        assert_eq!(tracker.get_committed_offset(&test_partition(1)), Some(20));

        tracker.mark_processed(&test_partition(1), 25);
        let offsets = tracker.get_committable_offsets().unwrap();
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets.get(&test_partition(1)), Some(&25));
    }

    #[test]
    fn test_partition_without_processed_offset_is_not_committable() {
        let tracker = OffsetTracker::new();
        tracker.advance_rewind_epoch(&test_partition(0));

        assert!(tracker.get_committable_offsets().unwrap().is_empty());
    }

    #[test]
    fn test_rewind_epoch_is_per_partition() {
        let tracker = OffsetTracker::new();

        assert_eq!(tracker.rewind_epoch(&test_partition(0)), 0);
        assert_eq!(tracker.advance_rewind_epoch(&test_partition(0)), 1);
        assert_eq!(tracker.advance_rewind_epoch(&test_partition(0)), 2);

        assert_eq!(tracker.rewind_epoch(&test_partition(0)), 2);
        assert_eq!(tracker.rewind_epoch(&test_partition(1)), 0);
    }

    #[test]
    fn test_clear_partition() {
        let tracker = OffsetTracker::new();
        tracker.mark_processed(&test_partition(0), 100);
        tracker.mark_processed(&test_partition(1), 200);
        tracker.advance_rewind_epoch(&test_partition(0));

        tracker.clear_partition(&test_partition(0));

        assert_eq!(tracker.partition_count(), 1);
        assert_eq!(tracker.get_partition_offset(&test_partition(0)), None);
        assert_eq!(tracker.rewind_epoch(&test_partition(0)), 0);
        assert_eq!(tracker.get_partition_offset(&test_partition(1)), Some(200));
    }
}
