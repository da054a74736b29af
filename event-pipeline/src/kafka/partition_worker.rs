//! Partition Worker - Dedicated worker for processing records from a single partition
//!
//! Each partition gets its own worker with a bounded channel, ensuring:
//! 1. Ordering is preserved within each partition
//! 2. Parallelism is achieved across partitions
//! 3. Backpressure is applied when processing falls behind
//!
//! When a batch comes back with failed records the worker commits up to the first
//! failure, asks the consumer to seek the partition back to it, and drops every
//! batch that was routed before that seek.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::StreamRecord;
use crate::kafka::batch_consumer::BatchProcessor;
use crate::kafka::batch_context::{ConsumerCommand, ConsumerCommandSender};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;
use crate::metrics_consts::{PARTITION_REWINDS_COUNTER, STALE_BATCHES_DROPPED_COUNTER};

/// A batch of records for a single partition
#[derive(Debug)]
pub struct PartitionBatch {
    pub partition: Partition,
    pub records: Vec<StreamRecord>,
    /// Rewind epoch of the partition when the batch was routed
    pub rewind_epoch: u64,
}

impl PartitionBatch {
    pub fn new(partition: Partition, records: Vec<StreamRecord>, rewind_epoch: u64) -> Self {
        Self {
            partition,
            records,
            rewind_epoch,
        }
    }

    pub fn max_offset(&self) -> Option<i64> {
        self.records.iter().map(|r| r.id.offset).max()
    }
}

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 10,
        }
    }
}

pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionBatch>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new(
        partition: Partition,
        processor: Arc<dyn BatchProcessor>,
        offset_tracker: Arc<OffsetTracker>,
        commands: ConsumerCommandSender,
        config: &PartitionWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let partition_clone = partition.clone();

        let handle = tokio::spawn(async move {
            Self::run_worker(
                partition_clone,
                receiver,
                processor,
                offset_tracker,
                commands,
            )
            .await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// Awaits until channel has capacity. Returns error only if channel is closed
    pub async fn send(
        &self,
        batch: PartitionBatch,
    ) -> Result<(), mpsc::error::SendError<PartitionBatch>> {
        self.sender.send(batch).await
    }

    /// Get a clone of the sender for use outside of DashMap guards
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Close the channel and wait for queued batches to drain
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!(partition = %self.partition, "Partition worker shut down gracefully");
                }
                Err(e) => {
                    warn!(
                        partition = %self.partition,
                        error = ?e,
                        "Partition worker panicked during shutdown"
                    );
                }
            }
        }
    }

    async fn run_worker(
        partition: Partition,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        processor: Arc<dyn BatchProcessor>,
        offset_tracker: Arc<OffsetTracker>,
        commands: ConsumerCommandSender,
    ) {
        info!(partition = %partition, "Starting partition worker");

        // Batches stamped with an older epoch were read before our last seek
        let mut min_epoch = 0;

        while let Some(batch) = receiver.recv().await {
            if batch.rewind_epoch < min_epoch {
                debug!(
                    partition = %partition,
                    rewind_epoch = batch.rewind_epoch,
                    min_epoch,
                    record_count = batch.records.len(),
                    "Dropping batch routed before rewind"
                );
                metrics::counter!(STALE_BATCHES_DROPPED_COUNTER).increment(1);
                continue;
            }

            let max_offset = batch.max_offset();
            let result = processor.process_batch(batch.records).await;

            match result.redelivery_offsets().get(&partition).copied() {
                None => {
                    if let Some(max_offset) = max_offset {
                        offset_tracker.mark_processed(&partition, max_offset + 1);
                    }
                }
                Some(rewind_to) => {
                    // everything before the first failure is acknowledged
                    offset_tracker.mark_processed(&partition, rewind_to);
                    min_epoch = offset_tracker.rewind_epoch(&partition) + 1;

                    warn!(
                        partition = %partition,
                        offset = rewind_to,
                        failed = result.failed_records().count(),
                        "Batch has failed records, rewinding partition for redelivery"
                    );
                    metrics::counter!(PARTITION_REWINDS_COUNTER).increment(1);

                    let command = ConsumerCommand::Seek {
                        partition: partition.clone(),
                        offset: rewind_to,
                    };
                    if commands.send(command).is_err() {
                        warn!(
                            partition = %partition,
                            "Consumer command channel closed, rewind not requested"
                        );
                    }
                }
            }
        }

        info!(partition = %partition, "Partition worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{BatchResult, RecordId, RecordOutcome, RecordStatus};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fails every record whose offset is in `failing` on its first delivery.
    #[derive(Default)]
    struct FlakyProcessor {
        failing: Mutex<HashSet<i64>>,
        seen: Mutex<Vec<i64>>,
    }

    impl FlakyProcessor {
        fn failing_once(offsets: &[i64]) -> Self {
            Self {
                failing: Mutex::new(offsets.iter().copied().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchProcessor for FlakyProcessor {
        async fn process_batch(&self, records: Vec<StreamRecord>) -> BatchResult {
            let mut failing = self.failing.lock().unwrap();
            let mut seen = self.seen.lock().unwrap();
            let outcomes = records
                .into_iter()
                .map(|record| {
                    seen.push(record.id.offset);
                    let status = if failing.remove(&record.id.offset) {
                        RecordStatus::Failed {
                            reason: "store down".to_string(),
                        }
                    } else {
                        RecordStatus::Duplicate
                    };
                    RecordOutcome {
                        id: record.id,
                        status,
                    }
                })
                .collect();
            BatchResult { outcomes }
        }
    }

    fn partition() -> Partition {
        Partition::new("events".to_string(), 0)
    }

    fn batch(offsets: std::ops::Range<i64>, epoch: u64) -> PartitionBatch {
        let records = offsets
            .map(|offset| StreamRecord::new(RecordId::new("events", 0, offset), None))
            .collect();
        PartitionBatch::new(partition(), records, epoch)
    }

    #[tokio::test]
    async fn test_successful_batches_advance_offset() {
        let tracker = Arc::new(OffsetTracker::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let processor = Arc::new(FlakyProcessor::default());
        let worker = PartitionWorker::new(
            partition(),
            processor.clone(),
            tracker.clone(),
            tx,
            &PartitionWorkerConfig::default(),
        );

        worker.send(batch(0..5, 0)).await.unwrap();
        worker.send(batch(5..8, 0)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(tracker.get_partition_offset(&partition()), Some(8));
        assert_eq!(processor.seen(), (0..8).collect::<Vec<_>>());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_record_rewinds_and_drops_stale_batches() {
        let tracker = Arc::new(OffsetTracker::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let processor = Arc::new(FlakyProcessor::failing_once(&[12, 14]));
        let worker = PartitionWorker::new(
            partition(),
            processor.clone(),
            tracker.clone(),
            tx,
            &PartitionWorkerConfig::default(),
        );

        // the second batch was read before the rewind and must be skipped
        worker.send(batch(10..16, 0)).await.unwrap();
        worker.send(batch(16..20, 0)).await.unwrap();

        let command = rx.recv().await.unwrap();
        let ConsumerCommand::Seek { partition: p, offset } = command;
        assert_eq!(p, partition());
        assert_eq!(offset, 12);

        // what the consumer does after seeking
        let epoch = tracker.advance_rewind_epoch(&partition());
        worker.send(batch(12..20, epoch)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(tracker.get_partition_offset(&partition()), Some(20));
        let mut expected: Vec<i64> = (10..16).collect();
        expected.extend(12..20);
        assert_eq!(processor.seen(), expected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_marks_offset_of_first_failed_record() {
        let tracker = Arc::new(OffsetTracker::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let processor = Arc::new(FlakyProcessor::failing_once(&[3]));
        let worker = PartitionWorker::new(
            partition(),
            processor,
            tracker.clone(),
            tx,
            &PartitionWorkerConfig::default(),
        );

        worker.send(batch(0..6, 0)).await.unwrap();
        worker.shutdown().await;

        assert!(rx.recv().await.is_some());
        assert_eq!(tracker.get_partition_offset(&partition()), Some(3));
    }
}
