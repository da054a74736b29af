// ==== Record outcomes ====
/// Counter for processed records, labelled by `status` (written/duplicate/invalid/failed)
pub const RECORD_OUTCOMES_COUNTER: &str = "event_pipeline_record_outcomes_total";

/// Counter for records that failed validation, labelled by `reason`
pub const INVALID_RECORDS_COUNTER: &str = "event_pipeline_invalid_records_total";

// ==== Batch coordinator ====
/// Histogram for batch processing duration in milliseconds
pub const BATCH_PROCESSING_DURATION_MS: &str = "event_pipeline_batch_processing_duration_ms";

/// Histogram for batch size (number of records per batch)
pub const BATCH_SIZE_HISTOGRAM: &str = "event_pipeline_batch_size_records";

/// Counter for batches that had at least one failed record
pub const BATCHES_WITH_FAILURES_COUNTER: &str = "event_pipeline_batches_with_failures_total";

/// Counter for records that reached the batch deadline before their dedup decision
pub const BATCH_DEADLINE_EXCEEDED_COUNTER: &str = "event_pipeline_batch_deadline_exceeded_total";

/// Gauges for the data quality percentages of the last batch
pub const BATCH_VALIDITY_GAUGE: &str = "event_pipeline_batch_validity_percentage";
pub const BATCH_UNIQUENESS_GAUGE: &str = "event_pipeline_batch_uniqueness_percentage";
pub const BATCH_SUCCESS_GAUGE: &str = "event_pipeline_batch_success_percentage";

// ==== Backends ====
/// Counter for retried backend calls, labelled by `operation`
pub const BACKEND_RETRIES: &str = "event_pipeline_backend_retries_total";

/// Counter for dedup decisions, labelled by `decision` (admitted/duplicate)
pub const DEDUP_DECISIONS: &str = "event_pipeline_dedup_decisions_total";

/// Counter for dedup calls that exhausted their retries
pub const DEDUP_STORE_ERRORS: &str = "event_pipeline_dedup_store_errors_total";

/// Counter for object writes, labelled by `status` (success/failure)
pub const OBJECT_WRITES_COUNTER: &str = "event_pipeline_object_writes_total";

/// Histogram for object write duration including retries, in milliseconds
pub const OBJECT_WRITE_DURATION_MS: &str = "event_pipeline_object_write_duration_ms";

/// Counter for quarantined records, labelled by `status` (success/failure) of the publish
pub const QUARANTINE_PUBLISHED_COUNTER: &str = "event_pipeline_quarantine_published_total";

// ==== Kafka consumer ====
/// Counter for Kafka consumer errors, labelled by `error` kind
pub const KAFKA_CONSUMER_ERRORS: &str = "event_pipeline_kafka_consumer_errors_total";

/// Counter for messages received from Kafka
pub const KAFKA_MESSAGES_RECEIVED: &str = "event_pipeline_kafka_messages_received_total";

/// Counter for partition rewinds requested after failed records
pub const PARTITION_REWINDS_COUNTER: &str = "event_pipeline_partition_rewinds_total";

/// Counter for batches dropped by a worker because they were routed before a rewind
pub const STALE_BATCHES_DROPPED_COUNTER: &str = "event_pipeline_stale_batches_dropped_total";

/// Counter for offset commits, labelled by `status` (success/failure)
pub const OFFSET_COMMITS_COUNTER: &str = "event_pipeline_offset_commits_total";

/// Gauge for the number of partitions with a running worker
pub const ACTIVE_PARTITION_WORKERS_GAUGE: &str = "event_pipeline_active_partition_workers";
