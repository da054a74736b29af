//! Partition Router - Routes records to partition-specific workers
//!
//! Workers are created synchronously during partition assignment and removed during
//! revocation. Routing only sends to existing workers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::coordinator::StreamRecord;
use crate::kafka::batch_consumer::BatchProcessor;
use crate::kafka::batch_context::ConsumerCommandSender;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_worker::{PartitionBatch, PartitionWorker, PartitionWorkerConfig};
use crate::kafka::types::Partition;
use crate::metrics_consts::ACTIVE_PARTITION_WORKERS_GAUGE;

pub struct PartitionRouter {
    workers: DashMap<Partition, PartitionWorker>,
    processor: Arc<dyn BatchProcessor>,
    offset_tracker: Arc<OffsetTracker>,
    commands: ConsumerCommandSender,
    config: PartitionWorkerConfig,
}

impl PartitionRouter {
    pub fn new(
        processor: Arc<dyn BatchProcessor>,
        offset_tracker: Arc<OffsetTracker>,
        commands: ConsumerCommandSender,
        config: PartitionWorkerConfig,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            processor,
            offset_tracker,
            commands,
            config,
        }
    }

    /// Add a worker for a partition. An existing worker is reused, which covers a
    /// rapid revoke -> assign where cleanup has not run yet.
    pub fn add_partition(&self, partition: Partition) {
        if self.workers.contains_key(&partition) {
            info!(partition = %partition, "Worker already exists, reusing");
            return;
        }

        info!(partition = %partition, "Creating partition worker");
        let worker = PartitionWorker::new(
            partition.clone(),
            self.processor.clone(),
            self.offset_tracker.clone(),
            self.commands.clone(),
            &self.config,
        );
        self.workers.insert(partition, worker);
        metrics::gauge!(ACTIVE_PARTITION_WORKERS_GAUGE).set(self.workers.len() as f64);
    }

    pub fn add_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            self.add_partition(partition.clone());
        }
    }

    /// Remove workers for partitions, returning them for async shutdown
    pub fn remove_partitions(&self, partitions: &[Partition]) -> Vec<PartitionWorker> {
        let removed: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|p| {
                let worker = self.workers.remove(p).map(|(_, w)| w);
                if worker.is_some() {
                    info!(partition = %p, "Removed partition worker");
                }
                worker
            })
            .collect();

        metrics::gauge!(ACTIVE_PARTITION_WORKERS_GAUGE).set(self.workers.len() as f64);
        removed
    }

    /// Remove every worker (shutdown)
    pub fn remove_all(&self) -> Vec<PartitionWorker> {
        let partitions: Vec<Partition> = self.workers.iter().map(|w| w.key().clone()).collect();
        self.remove_partitions(&partitions)
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    // Clone the sender so the DashMap guard is released before any await
    fn get_partition_sender(&self, partition: &Partition) -> Result<mpsc::Sender<PartitionBatch>> {
        let worker = self
            .workers
            .get(partition)
            .ok_or_else(|| anyhow!("No worker for partition {partition} - was it assigned?"))?;
        Ok(worker.sender())
    }

    /// Send a batch to its partition's worker, waiting while the worker's channel is full
    pub async fn route_batch(&self, batch: PartitionBatch) -> Result<()> {
        let partition = batch.partition.clone();
        let sender = self.get_partition_sender(&partition)?;

        sender
            .send(batch)
            .await
            .map_err(|_| anyhow!("Failed to send batch to worker for {partition}: channel closed"))
    }

    /// Group records by partition, stamp each group with the partition's current
    /// rewind epoch and route all groups concurrently.
    pub async fn route_records(&self, records: Vec<StreamRecord>) {
        if records.is_empty() {
            return;
        }

        let mut by_partition: HashMap<Partition, Vec<StreamRecord>> = HashMap::new();
        for record in records {
            by_partition
                .entry(record.id.partition())
                .or_default()
                .push(record);
        }

        let route_futures: Vec<_> = by_partition
            .into_iter()
            .map(|(partition, records)| {
                let epoch = self.offset_tracker.rewind_epoch(&partition);
                let batch = PartitionBatch::new(partition.clone(), records, epoch);
                async move { (partition, self.route_batch(batch).await) }
            })
            .collect();

        // workers may have been removed during a rebalance; their records will be
        // redelivered to the new owner from the last committed offset
        for (partition, result) in join_all(route_futures).await {
            if let Err(e) = result {
                warn!(partition = %partition, "Failed to route batch: {e:#}");
            }
        }
    }
}

/// Shut down workers concurrently, draining their queued batches
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    join_all(workers.into_iter().map(|w| w.shutdown())).await;
}
