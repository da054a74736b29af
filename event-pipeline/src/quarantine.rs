//! Destination for records that can never be processed.
//!
//! Every quarantined record is logged with its reason and the original payload so it
//! can be reconciled by hand. With a quarantine topic configured the payload is also
//! produced to Kafka unchanged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{error, warn};

use crate::coordinator::StreamRecord;
use crate::error::ValidationError;
use crate::metrics_consts::QUARANTINE_PUBLISHED_COUNTER;

pub const QUARANTINE_REASON_HEADER: &str = "quarantine_reason";
pub const QUARANTINE_SOURCE_HEADER: &str = "source";

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives invalid records. Never fails: a record is invalid whether or not the
/// sink managed to keep a copy of it.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    async fn quarantine(&self, record: &StreamRecord, reason: &ValidationError);
}

fn log_quarantined(record: &StreamRecord, reason: &ValidationError) {
    let payload = record
        .payload
        .as_deref()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();

    warn!(
        topic = %record.id.topic,
        partition = record.id.partition,
        offset = record.id.offset,
        reason = %reason,
        payload = %payload,
        "quarantined invalid record"
    );
}

/// Logs the record and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogQuarantine;

#[async_trait]
impl QuarantineSink for LogQuarantine {
    async fn quarantine(&self, record: &StreamRecord, reason: &ValidationError) {
        log_quarantined(record, reason);
    }
}

/// Logs the record and produces its original payload to a quarantine topic.
#[derive(Clone)]
pub struct KafkaQuarantine {
    producer: FutureProducer,
    topic: String,
}

impl KafkaQuarantine {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn from_hosts(hosts: &str, tls: bool, topic: &str) -> Result<Self, KafkaError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", hosts)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "snappy");
        if tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        Ok(Self::new(config.create()?, topic))
    }
}

#[async_trait]
impl QuarantineSink for KafkaQuarantine {
    async fn quarantine(&self, record: &StreamRecord, reason: &ValidationError) {
        log_quarantined(record, reason);

        let reason = reason.to_string();
        let source = record.id.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: QUARANTINE_REASON_HEADER,
                value: Some(reason.as_str()),
            })
            .insert(Header {
                key: QUARANTINE_SOURCE_HEADER,
                value: Some(source.as_str()),
            });

        let kafka_record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&self.topic)
            .payload(record.payload.as_deref().unwrap_or_default())
            .headers(headers);

        match self.producer.send(kafka_record, PRODUCE_TIMEOUT).await {
            Ok(_) => {
                metrics::counter!(QUARANTINE_PUBLISHED_COUNTER, "status" => "success")
                    .increment(1);
            }
            Err((e, _)) => {
                metrics::counter!(QUARANTINE_PUBLISHED_COUNTER, "status" => "failure")
                    .increment(1);
                error!(
                    quarantine_topic = %self.topic,
                    source = %source,
                    error = ?e,
                    "failed to publish record to quarantine topic"
                );
            }
        }
    }
}

/// Keeps quarantined records in memory, for tests.
#[derive(Clone, Default)]
pub struct RecordingQuarantine {
    records: Arc<Mutex<Vec<(StreamRecord, ValidationError)>>>,
}

impl RecordingQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(StreamRecord, ValidationError)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuarantineSink for RecordingQuarantine {
    async fn quarantine(&self, record: &StreamRecord, reason: &ValidationError) {
        log_quarantined(record, reason);
        if let Ok(mut records) = self.records.lock() {
            records.push((record.clone(), reason.clone()));
        }
    }
}
