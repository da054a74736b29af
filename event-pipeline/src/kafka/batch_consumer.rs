use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, MessageStream, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::coordinator::{BatchResult, StreamRecord};
use crate::kafka::batch_context::{BatchConsumerContext, ConsumerCommand, ConsumerCommandReceiver};
use crate::kafka::message::stream_record;
use crate::kafka::offset_tracker::{OffsetTracker, OffsetTrackerError};
use crate::kafka::partition_router::{shutdown_workers, PartitionRouter};
use crate::kafka::partition_worker::PartitionWorkerConfig;
use crate::metrics_consts::{KAFKA_CONSUMER_ERRORS, KAFKA_MESSAGES_RECEIVED, OFFSET_COMMITS_COUNTER};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Processes the records of one partition batch. Implemented by the batch coordinator.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, records: Vec<StreamRecord>) -> BatchResult;
}

#[derive(Debug, Clone)]
pub struct BatchConsumerConfig {
    pub topic: String,
    /// Maximum records collected before routing
    pub batch_size: usize,
    /// Maximum time spent collecting one batch
    pub batch_collect_timeout: Duration,
    pub commit_interval: Duration,
    /// How long shutdown waits for workers to drain their queues
    pub shutdown_timeout: Duration,
    pub worker: PartitionWorkerConfig,
}

pub struct BatchConsumer {
    consumer: StreamConsumer<BatchConsumerContext>,
    router: Arc<PartitionRouter>,
    offset_tracker: Arc<OffsetTracker>,
    commands: ConsumerCommandReceiver,
    config: BatchConsumerConfig,
    // shutdown signal from the parent process
    shutdown_rx: oneshot::Receiver<()>,
}

impl BatchConsumer {
    pub fn new(
        client_config: &ClientConfig,
        processor: Arc<dyn BatchProcessor>,
        config: BatchConsumerConfig,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<Self> {
        let offset_tracker = Arc::new(OffsetTracker::new());
        let (command_tx, commands) = tokio::sync::mpsc::unbounded_channel();
        let router = Arc::new(PartitionRouter::new(
            processor,
            offset_tracker.clone(),
            command_tx,
            config.worker.clone(),
        ));

        let context = BatchConsumerContext::new(router.clone(), offset_tracker.clone());
        let consumer: StreamConsumer<BatchConsumerContext> = client_config
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("Failed to subscribe to topic: {}", config.topic))?;

        Ok(Self {
            consumer,
            router,
            offset_tracker,
            commands,
            config,
            shutdown_rx,
        })
    }

    /// Consume until shutdown is signalled or a fatal Kafka error occurs.
    ///
    /// One iteration collects a batch, routes it to the partition workers, applies the
    /// rewinds workers asked for and commits tracked offsets when the commit interval
    /// has elapsed. Rewinds are applied between batches so every batch is routed with
    /// a rewind epoch that matches the position it was read from.
    pub async fn start_consumption(self) -> Result<()> {
        let Self {
            consumer,
            router,
            offset_tracker,
            mut commands,
            config,
            mut shutdown_rx,
        } = self;

        info!(topic = %config.topic, "Starting batch Kafka message consumption");

        let mut stream = consumer.stream();
        let mut last_commit = Instant::now();
        let mut kafka_error_count = 0;

        loop {
            match shutdown_rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => {
                    info!("Shutdown signal received, starting graceful shutdown");
                    break;
                }
            }

            let records = Self::consume_batch(
                &mut stream,
                config.batch_size,
                config.batch_collect_timeout,
                &mut kafka_error_count,
            )
            .await?;

            if !records.is_empty() {
                metrics::counter!(KAFKA_MESSAGES_RECEIVED).increment(records.len() as u64);
                router.route_records(records).await;
            }

            while let Ok(command) = commands.try_recv() {
                Self::handle_command(&consumer, &router, &offset_tracker, command)?;
            }

            if last_commit.elapsed() >= config.commit_interval {
                Self::commit_tracked_offsets(&consumer, &offset_tracker);
                last_commit = Instant::now();
            }
        }

        let workers = router.remove_all();
        info!(workers = workers.len(), "Draining partition workers");
        if tokio::time::timeout(config.shutdown_timeout, shutdown_workers(workers))
            .await
            .is_err()
        {
            warn!(
                timeout_secs = config.shutdown_timeout.as_secs(),
                "Partition workers did not drain in time, unfinished batches will be redelivered"
            );
        }

        Self::commit_tracked_offsets(&consumer, &offset_tracker);
        info!("Graceful shutdown completed");

        Ok(())
    }

    fn handle_command(
        consumer: &StreamConsumer<BatchConsumerContext>,
        router: &PartitionRouter,
        offset_tracker: &OffsetTracker,
        command: ConsumerCommand,
    ) -> Result<()> {
        match command {
            ConsumerCommand::Seek { partition, offset } => {
                if !router.has_partition(&partition) {
                    debug!(
                        partition = %partition,
                        offset,
                        "Partition no longer assigned, skipping rewind"
                    );
                    return Ok(());
                }

                // Failing here is fatal: the committed offset never passes the first
                // failed record, so a restart redelivers it.
                consumer
                    .seek(
                        partition.topic(),
                        partition.partition_number(),
                        Offset::Offset(offset),
                        SEEK_TIMEOUT,
                    )
                    .with_context(|| {
                        format!("Failed to rewind partition {partition} to {offset}")
                    })?;

                let epoch = offset_tracker.advance_rewind_epoch(&partition);
                info!(
                    partition = %partition,
                    offset,
                    epoch,
                    "Rewound partition for redelivery"
                );
            }
        }
        Ok(())
    }

    /// Commit offsets from the offset tracker to Kafka. Skipped during rebalancing.
    fn commit_tracked_offsets(
        consumer: &StreamConsumer<BatchConsumerContext>,
        offset_tracker: &OffsetTracker,
    ) {
        let offsets = match offset_tracker.get_committable_offsets() {
            Ok(offsets) => offsets,
            Err(OffsetTrackerError::RebalanceInProgress) => {
                info!("Skipping offset commit during rebalancing");
                metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "skipped").increment(1);
                return;
            }
        };

        if offsets.is_empty() {
            return;
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in &offsets {
            if let Err(e) = list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            ) {
                warn!(partition = %partition, "Invalid offset {next_offset} for commit: {e}");
            }
        }

        match consumer.commit(&list, CommitMode::Sync) {
            Ok(_) => {
                info!("Committed offsets for {} partitions", offsets.len());
                metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "success").increment(1);
                offset_tracker.mark_committed(&offsets);
            }
            Err(e) => {
                warn!("Failed to commit tracked offsets: {e}");
                metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "failure").increment(1);
            }
        }
    }

    /// Collect up to `batch_size` records, or whatever arrived within `batch_timeout`.
    async fn consume_batch(
        stream: &mut MessageStream<'_, BatchConsumerContext>,
        batch_size: usize,
        batch_timeout: Duration,
        kafka_error_count: &mut u64,
    ) -> KafkaResult<Vec<StreamRecord>> {
        let deadline = Instant::now() + batch_timeout;
        let mut records = Vec::with_capacity(batch_size);

        while records.len() < batch_size {
            let Ok(next_msg) = tokio::time::timeout_at(deadline, stream.next()).await else {
                break;
            };

            match next_msg {
                Some(Ok(borrowed_message)) => {
                    records.push(stream_record(&borrowed_message));
                    *kafka_error_count = 0;
                }
                Some(Err(e)) => {
                    *kafka_error_count += 1;
                    if let Some(fatal) = handle_kafka_error(e, *kafka_error_count).await {
                        return Err(fatal);
                    }
                }
                None => break,
            }
        }

        Ok(records)
    }
}

/// How the consume loop reacts to a consumer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    Continue,
    /// Sleep `step` times the number of consecutive errors, capped at five steps.
    Backoff(Duration),
    Stop,
}

fn classify_kafka_error(e: &KafkaError) -> (&'static str, ErrorAction) {
    match e {
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut,
        ) => ("informational", ErrorAction::Continue),
        KafkaError::MessageConsumption(_) => {
            ("consumer", ErrorAction::Backoff(Duration::from_millis(100)))
        }
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => ("brokers_down", ErrorAction::Backoff(Duration::from_secs(1))),
        KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            ("authentication", ErrorAction::Stop)
        }
        KafkaError::Global(_) => ("global", ErrorAction::Backoff(Duration::from_millis(500))),
        KafkaError::MessageConsumptionFatal(_) => ("fatal", ErrorAction::Stop),
        KafkaError::Canceled => ("canceled", ErrorAction::Stop),
        _ => ("unexpected", ErrorAction::Backoff(Duration::from_millis(100))),
    }
}

/// Log, count and back off on a consumer error. Returns the error only when it ends
/// consumption.
async fn handle_kafka_error(e: KafkaError, consecutive: u64) -> Option<KafkaError> {
    let (kind, action) = classify_kafka_error(&e);
    metrics::counter!(KAFKA_CONSUMER_ERRORS, "error" => kind).increment(1);

    match action {
        ErrorAction::Continue => {
            debug!(error = ?e, "Kafka consumer notice");
            None
        }
        ErrorAction::Backoff(step) => {
            warn!(error = ?e, consecutive, "Kafka consumer error, backing off");
            sleep(step * consecutive.min(5) as u32).await;
            None
        }
        ErrorAction::Stop => {
            error!(error = ?e, "Kafka consumer error ends consumption");
            Some(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_error_classification() {
        assert_eq!(
            classify_kafka_error(&KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF)).1,
            ErrorAction::Continue
        );
        assert!(matches!(
            classify_kafka_error(&KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)).1,
            ErrorAction::Backoff(_)
        ));
        assert!(matches!(
            classify_kafka_error(&KafkaError::MessageConsumption(
                RDKafkaErrorCode::OffsetOutOfRange
            ))
            .1,
            ErrorAction::Backoff(_)
        ));
    }

    #[tokio::test]
    async fn test_fatal_errors_end_consumption() {
        let fatal = handle_kafka_error(
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fail),
            1,
        )
        .await;
        assert!(fatal.is_some());

        let auth =
            handle_kafka_error(KafkaError::Global(RDKafkaErrorCode::Authentication), 1).await;
        assert!(auth.is_some());

        assert!(handle_kafka_error(KafkaError::Canceled, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_are_absorbed() {
        for error in [
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
            KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut),
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
        ] {
            // no consecutive errors yet, so no backoff
            assert!(handle_kafka_error(error, 0).await.is_none());
        }
    }
}
