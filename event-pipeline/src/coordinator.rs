//! Batch coordinator.
//!
//! Drives every record of a batch through normalize -> dedup gate -> partition writer
//! and reports one outcome per record, in input order. Records never affect each
//! other: an invalid or failed record only changes its own outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dedup::{Admission, DedupGate};
use crate::error::ValidationError;
use crate::event::{normalize, parse_payload};
use crate::kafka::types::Partition;
use crate::kafka::BatchProcessor;
use crate::metrics_consts::{
    BATCHES_WITH_FAILURES_COUNTER, BATCH_DEADLINE_EXCEEDED_COUNTER,
    BATCH_PROCESSING_DURATION_MS, BATCH_SIZE_HISTOGRAM, BATCH_SUCCESS_GAUGE,
    BATCH_UNIQUENESS_GAUGE, BATCH_VALIDITY_GAUGE, INVALID_RECORDS_COUNTER,
    RECORD_OUTCOMES_COUNTER,
};
use crate::quarantine::QuarantineSink;
use crate::storage::PartitionWriter;

/// Sequence identifier of a record in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RecordId {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// A delivered record: its position in the stream and the undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: RecordId,
    pub payload: Option<Vec<u8>>,
}

impl StreamRecord {
    pub fn new(id: RecordId, payload: Option<Vec<u8>>) -> Self {
        Self { id, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// Stored under `key`.
    Written { key: String },
    /// Already admitted by an earlier delivery, acknowledged without a write.
    Duplicate,
    /// Can never be processed. Quarantined and acknowledged.
    Invalid { reason: ValidationError },
    /// A backend call ran out of retries or the batch deadline passed. Must be redelivered.
    Failed { reason: String },
}

impl RecordStatus {
    pub fn as_label(&self) -> &'static str {
        match self {
            RecordStatus::Written { .. } => "written",
            RecordStatus::Duplicate => "duplicate",
            RecordStatus::Invalid { .. } => "invalid",
            RecordStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub id: RecordId,
    pub status: RecordStatus,
}

/// Per batch data quality counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub written: usize,
    pub duplicate: usize,
    pub invalid: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn valid(&self) -> usize {
        self.total - self.invalid
    }

    /// Share of records that passed validation, in percent.
    pub fn validity_percentage(&self) -> f64 {
        self.percentage(self.valid())
    }

    /// Share of records that were valid and seen for the first time, in percent.
    pub fn uniqueness_percentage(&self) -> f64 {
        self.percentage(self.valid().saturating_sub(self.duplicate))
    }

    /// Share of records that need no redelivery, in percent.
    pub fn success_percentage(&self) -> f64 {
        self.percentage(self.total - self.failed)
    }

    fn percentage(&self, count: usize) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        count as f64 / self.total as f64 * 100.0
    }
}

/// Outcomes of one batch, in the order the records were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchResult {
    /// The batch can be acknowledged as a whole. Invalid and duplicate records do not
    /// block acknowledgement.
    pub fn is_success(&self) -> bool {
        self.failed_records().next().is_none()
    }

    /// Records that must be redelivered.
    pub fn failed_records(&self) -> impl Iterator<Item = &RecordId> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, RecordStatus::Failed { .. }))
            .map(|o| &o.id)
    }

    /// Lowest failed offset per partition: the position each partition must be
    /// redelivered from.
    pub fn redelivery_offsets(&self) -> HashMap<Partition, i64> {
        let mut offsets: HashMap<Partition, i64> = HashMap::new();
        for id in self.failed_records() {
            offsets
                .entry(id.partition())
                .and_modify(|offset| *offset = (*offset).min(id.offset))
                .or_insert(id.offset);
        }
        offsets
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.outcomes.len(),
            ..BatchSummary::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                RecordStatus::Written { .. } => summary.written += 1,
                RecordStatus::Duplicate => summary.duplicate += 1,
                RecordStatus::Invalid { .. } => summary.invalid += 1,
                RecordStatus::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    dedup: DedupGate,
    writer: PartitionWriter,
    quarantine: Arc<dyn QuarantineSink>,
    batch_timeout: Duration,
    record_concurrency: usize,
}

impl BatchCoordinator {
    pub fn new(
        dedup: DedupGate,
        writer: PartitionWriter,
        quarantine: Arc<dyn QuarantineSink>,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            dedup,
            writer,
            quarantine,
            batch_timeout,
            record_concurrency: 1,
        }
    }

    /// Process up to `concurrency` records at a time. Outcomes keep input order.
    pub fn with_record_concurrency(mut self, concurrency: usize) -> Self {
        self.record_concurrency = concurrency.max(1);
        self
    }

    pub async fn process_batch(&self, records: Vec<StreamRecord>) -> BatchResult {
        let start = Instant::now();
        let deadline = start + self.batch_timeout;
        let batch_size = records.len();

        let outcomes: Vec<RecordOutcome> = stream::iter(records)
            .map(|record| async move {
                let status = self.process_record(&record, deadline).await;
                metrics::counter!(RECORD_OUTCOMES_COUNTER, "status" => status.as_label())
                    .increment(1);
                RecordOutcome {
                    id: record.id,
                    status,
                }
            })
            .buffered(self.record_concurrency)
            .collect()
            .await;

        let result = BatchResult { outcomes };
        let summary = result.summary();

        metrics::histogram!(BATCH_SIZE_HISTOGRAM).record(batch_size as f64);
        metrics::histogram!(BATCH_PROCESSING_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);
        metrics::gauge!(BATCH_VALIDITY_GAUGE).set(summary.validity_percentage());
        metrics::gauge!(BATCH_UNIQUENESS_GAUGE).set(summary.uniqueness_percentage());
        metrics::gauge!(BATCH_SUCCESS_GAUGE).set(summary.success_percentage());

        if summary.failed > 0 {
            metrics::counter!(BATCHES_WITH_FAILURES_COUNTER).increment(1);
            warn!(
                total = summary.total,
                written = summary.written,
                duplicate = summary.duplicate,
                invalid = summary.invalid,
                failed = summary.failed,
                "batch processed with failed records"
            );
        } else {
            info!(
                total = summary.total,
                written = summary.written,
                duplicate = summary.duplicate,
                invalid = summary.invalid,
                validity = summary.validity_percentage(),
                uniqueness = summary.uniqueness_percentage(),
                duration_ms = start.elapsed().as_millis() as u64,
                "batch processed"
            );
        }

        result
    }

    // The deadline is checked before the dedup decision and never cancels one in
    // flight. An admitted event's write runs to completion or to retry exhaustion.
    async fn process_record(&self, record: &StreamRecord, deadline: Instant) -> RecordStatus {
        let event = match parse_payload(record.payload.as_deref()).and_then(normalize) {
            Ok(event) => event,
            Err(reason) => {
                metrics::counter!(INVALID_RECORDS_COUNTER, "reason" => reason.kind())
                    .increment(1);
                self.quarantine.quarantine(record, &reason).await;
                return RecordStatus::Invalid { reason };
            }
        };

        if Instant::now() >= deadline {
            metrics::counter!(BATCH_DEADLINE_EXCEEDED_COUNTER).increment(1);
            return RecordStatus::Failed {
                reason: format!(
                    "batch deadline of {:?} exceeded before dedup decision",
                    self.batch_timeout
                ),
            };
        }

        let admission = match self.dedup.admit(&event.event_uuid).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(
                    record = %record.id,
                    event_uuid = %event.event_uuid,
                    error = ?e,
                    "dedup check failed, record will be redelivered"
                );
                return RecordStatus::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if admission == Admission::Duplicate {
            return RecordStatus::Duplicate;
        }

        match self.writer.write(&event).await {
            Ok(key) => RecordStatus::Written { key },
            Err(e) => {
                // The dedup record already exists, so a redelivery of this event is a
                // duplicate and the object stays missing.
                error!(
                    record = %record.id,
                    event_uuid = %event.event_uuid,
                    error = ?e,
                    "object write failed after the event was admitted"
                );
                RecordStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl BatchProcessor for BatchCoordinator {
    async fn process_batch(&self, records: Vec<StreamRecord>) -> BatchResult {
        BatchCoordinator::process_batch(self, records).await
    }
}
