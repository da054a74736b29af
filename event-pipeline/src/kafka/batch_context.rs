use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_router::{shutdown_workers, PartitionRouter};
use crate::kafka::types::Partition;

/// Commands sent from partition workers to the consumer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCommand {
    /// Rewind `partition` so records from `offset` on are delivered again
    Seek { partition: Partition, offset: i64 },
}

pub type ConsumerCommandSender = mpsc::UnboundedSender<ConsumerCommand>;
pub type ConsumerCommandReceiver = mpsc::UnboundedReceiver<ConsumerCommand>;

/// Consumer context that keeps partition workers in step with the group assignment.
///
/// Workers are created and removed synchronously inside the librdkafka callbacks so
/// no record is ever routed to a partition without a worker. Draining a revoked
/// worker is slow and happens on a spawned task.
pub struct BatchConsumerContext {
    router: Arc<PartitionRouter>,
    offset_tracker: Arc<OffsetTracker>,
    rt_handle: Handle,
}

impl BatchConsumerContext {
    pub fn new(router: Arc<PartitionRouter>, offset_tracker: Arc<OffsetTracker>) -> Self {
        Self {
            router,
            offset_tracker,
            rt_handle: Handle::current(),
        }
    }

    fn partitions(list: &TopicPartitionList) -> Vec<Partition> {
        list.elements().into_iter().map(Partition::from).collect()
    }

    fn revoke(&self, partitions: Vec<Partition>) {
        let workers = self.router.remove_partitions(&partitions);
        info!(
            partitions = partitions.len(),
            workers = workers.len(),
            "Revoking partitions"
        );

        let router = self.router.clone();
        let offset_tracker = self.offset_tracker.clone();
        self.rt_handle.spawn(async move {
            shutdown_workers(workers).await;

            for partition in &partitions {
                // a rapid revoke -> assign gives the partition a fresh worker whose
                // state must survive this cleanup
                if router.has_partition(partition) {
                    debug!(partition = %partition, "Partition reassigned, keeping its offsets");
                    continue;
                }
                offset_tracker.clear_partition(partition);
            }
        });
    }
}

impl ClientContext for BatchConsumerContext {}

impl ConsumerContext for BatchConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);
        self.offset_tracker.set_rebalancing(true);

        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                self.revoke(Self::partitions(partitions));
            }
            Rebalance::Assign(partitions) => {
                info!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Assign(partitions) => {
                let partitions = Self::partitions(partitions);
                info!("Assigned {} partitions", partitions.len());
                self.router.add_partitions(&partitions);
            }
            Rebalance::Revoke(_) => {
                info!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }

        self.offset_tracker.set_rebalancing(false);
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
