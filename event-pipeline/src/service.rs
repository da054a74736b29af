use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::BatchCoordinator;
use crate::dedup::postgres::PgDedupStore;
use crate::dedup::DedupGate;
use crate::kafka::{BatchConsumer, BatchProcessor};
use crate::quarantine::{KafkaQuarantine, LogQuarantine, QuarantineSink};
use crate::storage::s3::S3ObjectStore;
use crate::storage::PartitionWriter;

/// The event pipeline service: a Kafka batch consumer feeding the batch coordinator
pub struct EventPipelineService {
    config: Config,
    consumer: Option<BatchConsumer>,
    processor: Arc<dyn BatchProcessor>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EventPipelineService {
    /// Create the service and connect its backends.
    ///
    /// Fails when the configuration is invalid or when the dedup table or target bucket
    /// cannot be reached, before anything is consumed.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        let coordinator = build_coordinator(&config).await?;
        Ok(Self {
            config,
            consumer: None,
            processor: Arc::new(coordinator),
            shutdown_tx: None,
        })
    }

    /// Create a service with a custom processor (useful for testing)
    pub fn with_processor(config: Config, processor: Arc<dyn BatchProcessor>) -> Result<Self> {
        config.validate().with_context(|| {
            "Configuration validation failed for service with custom processor".to_string()
        })?;

        Ok(Self {
            config,
            consumer: None,
            processor,
            shutdown_tx: None,
        })
    }

    /// Create the Kafka consumer and subscribe to the input topic
    pub fn initialize(&mut self) -> Result<()> {
        if self.consumer.is_some() {
            return Err(anyhow::anyhow!("Service already initialized"));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let consumer = BatchConsumer::new(
            &self.config.consumer_config(),
            self.processor.clone(),
            self.config.batch_consumer_config(),
            shutdown_rx,
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;

        info!(
            topic = %self.config.kafka_consumer_topic,
            group = %self.config.kafka_consumer_group,
            bucket = %self.config.target_container,
            dedup_table = %self.config.dedup_table,
            "Initialized event pipeline consumer"
        );

        self.consumer = Some(consumer);
        Ok(())
    }

    /// Run until ctrl+c or a fatal consumer error
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(mut self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        if self.consumer.is_none() {
            self.initialize()?;
        }

        let consumer = self
            .consumer
            .take()
            .ok_or_else(|| anyhow::anyhow!("Consumer not initialized"))?;

        info!("Starting event pipeline service");

        let mut consumer_handle = tokio::spawn(consumer.start_consumption());

        tokio::select! {
            _ = shutdown_signal => {
                info!("Received shutdown signal, shutting down gracefully...");
            }
            result = &mut consumer_handle => {
                // the consumer only returns on its own after a fatal Kafka error
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.context("Consumer stopped with a fatal error")),
                    Err(e) => Err(anyhow::Error::new(e).context("Consumer task panicked")),
                };
            }
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            if shutdown_tx.send(()).is_err() {
                info!("Consumer already stopped");
            }
        }

        // workers drain within shutdown_timeout, leave room for the final commit
        let shutdown_timeout = self.config.shutdown_timeout() * 2;
        match tokio::time::timeout(shutdown_timeout, consumer_handle).await {
            Ok(Ok(Ok(_))) => info!("Consumer stopped normally"),
            Ok(Ok(Err(e))) => error!("Consumer stopped with error: {e:#}"),
            Ok(Err(e)) => error!("Consumer task panicked: {e:#}"),
            Err(_) => error!("Consumer shutdown timed out after {:?}", shutdown_timeout),
        }

        info!("Event pipeline service stopped");
        Ok(())
    }
}

/// Wire the dedup gate, partition writer and quarantine sink from configuration.
pub async fn build_coordinator(config: &Config) -> Result<BatchCoordinator> {
    let store = PgDedupStore::connect(
        &config.database_url,
        config.max_pg_connections,
        config.backend_timeout(),
        &config.dedup_table,
    )
    .await
    .context("Failed to connect to the dedup store database")?;

    if config.dedup_create_table {
        store
            .ensure_table()
            .await
            .with_context(|| format!("Failed to create dedup table '{}'", store.table()))?;
    } else {
        store
            .check_table()
            .await
            .with_context(|| format!("Dedup table '{}' is not usable", store.table()))?;
    }

    let objects = S3ObjectStore::from_settings(&config.s3_settings()).await;
    objects
        .check_bucket()
        .await
        .context("Target container is not usable")?;

    let quarantine: Arc<dyn QuarantineSink> = match &config.quarantine_topic {
        Some(topic) => Arc::new(
            KafkaQuarantine::from_hosts(&config.kafka_hosts, config.kafka_tls, topic)
                .with_context(|| format!("Failed to create quarantine producer for '{topic}'"))?,
        ),
        None => Arc::new(LogQuarantine),
    };

    info!(
        dedup_table = %store.table(),
        bucket = %objects.bucket(),
        key_prefix = ?config.key_prefix(),
        quarantine_topic = ?config.quarantine_topic,
        "Backends ready"
    );

    let retry_policy = config.retry_policy();
    let dedup = DedupGate::new(Arc::new(store), retry_policy.clone());
    let writer = PartitionWriter::new(Arc::new(objects), config.key_prefix(), retry_policy);

    Ok(
        BatchCoordinator::new(dedup, writer, quarantine, config.batch_timeout())
            .with_record_concurrency(config.record_concurrency),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{BatchResult, StreamRecord};
    use async_trait::async_trait;
    use envconfig::Envconfig;
    use std::collections::HashMap;
    use std::time::Duration;

    struct NoopProcessor;

    #[async_trait]
    impl BatchProcessor for NoopProcessor {
        async fn process_batch(&self, _records: Vec<StreamRecord>) -> BatchResult {
            BatchResult::default()
        }
    }

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = HashMap::from([
            ("TARGET_CONTAINER".to_string(), "events-bucket".to_string()),
            // nothing listens here, the consumer is created without connecting
            ("KAFKA_HOSTS".to_string(), "localhost:1".to_string()),
            ("BATCH_COLLECT_TIMEOUT_MS".to_string(), "50".to_string()),
            ("SHUTDOWN_TIMEOUT_SECS".to_string(), "1".to_string()),
        ]);
        for (key, value) in pairs {
            env.insert(key.to_string(), value.to_string());
        }
        Config::init_from_hashmap(&env).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_consuming() {
        let result = EventPipelineService::with_processor(
            config(&[("DEDUP_TABLE", "bad-name")]),
            Arc::new(NoopProcessor),
        );

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let mut service =
            EventPipelineService::with_processor(config(&[]), Arc::new(NoopProcessor)).unwrap();

        service.initialize().unwrap();
        assert!(service.initialize().is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let service =
            EventPipelineService::with_processor(config(&[]), Arc::new(NoopProcessor)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            service.run_with_shutdown(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .expect("service did not stop");

        assert!(result.is_ok());
    }
}
