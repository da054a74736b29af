#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use event_pipeline::coordinator::{BatchCoordinator, RecordId, StreamRecord};
use event_pipeline::dedup::{DedupGate, DedupRecord, DedupStore, InsertOutcome, MemoryDedupStore};
use event_pipeline::error::StoreError;
use event_pipeline::quarantine::RecordingQuarantine;
use event_pipeline::retry::RetryPolicy;
use event_pipeline::storage::memory::MemoryObjectStore;
use event_pipeline::storage::PartitionWriter;

pub const TEST_TOPIC: &str = "events";

/// A coordinator wired to in-memory backends, with handles to inspect them.
pub struct TestPipeline {
    pub coordinator: BatchCoordinator,
    pub dedup_store: MemoryDedupStore,
    pub objects: MemoryObjectStore,
    pub quarantine: RecordingQuarantine,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_backends(MemoryDedupStore::new(), MemoryObjectStore::new())
    }

    pub fn with_backends(dedup_store: MemoryDedupStore, objects: MemoryObjectStore) -> Self {
        Self::with_dedup_gate(
            dedup_store.clone(),
            DedupGate::new(Arc::new(dedup_store), fast_retries()),
            objects,
            Duration::from_secs(10),
        )
    }

    /// Dedup calls acknowledge `ack_delay` late for the first `slow_calls` calls.
    pub fn with_slow_dedup(
        ack_delay: Duration,
        slow_calls: usize,
        dedup_retries: RetryPolicy,
        batch_timeout: Duration,
    ) -> Self {
        let dedup_store = MemoryDedupStore::new();
        let slow = SlowAckDedupStore::new(dedup_store.clone(), ack_delay, slow_calls);
        Self::with_dedup_gate(
            dedup_store,
            DedupGate::new(Arc::new(slow), dedup_retries),
            MemoryObjectStore::new(),
            batch_timeout,
        )
    }

    fn with_dedup_gate(
        dedup_store: MemoryDedupStore,
        gate: DedupGate,
        objects: MemoryObjectStore,
        batch_timeout: Duration,
    ) -> Self {
        let quarantine = RecordingQuarantine::new();
        let coordinator = BatchCoordinator::new(
            gate,
            PartitionWriter::new(Arc::new(objects.clone()), None, fast_retries()),
            Arc::new(quarantine.clone()),
            batch_timeout,
        );

        Self {
            coordinator,
            dedup_store,
            objects,
            quarantine,
        }
    }
}

/// Commits the insert right away, then holds the acknowledgement back.
pub struct SlowAckDedupStore {
    inner: MemoryDedupStore,
    ack_delay: Duration,
    slow_calls: usize,
    calls: AtomicUsize,
}

impl SlowAckDedupStore {
    pub fn new(inner: MemoryDedupStore, ack_delay: Duration, slow_calls: usize) -> Self {
        Self {
            inner,
            ack_delay,
            slow_calls,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DedupStore for SlowAckDedupStore {
    async fn insert_if_absent(&self, record: &DedupRecord) -> Result<InsertOutcome, StoreError> {
        let outcome = self.inner.insert_if_absent(record).await;
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.slow_calls {
            tokio::time::sleep(self.ack_delay).await;
        }
        outcome
    }
}

pub fn retries_with_attempt_timeout(attempt_timeout: Duration) -> RetryPolicy {
    RetryPolicy::build(2, Duration::from_millis(1))
        .max_retries(2)
        .attempt_timeout(attempt_timeout)
        .without_jitter()
        .provide()
}

pub fn fast_retries() -> RetryPolicy {
    retries_with_attempt_timeout(Duration::from_secs(1))
}

pub fn event(uuid: &str, event_name: &str, created_at: i64) -> Value {
    json!({
        "event_uuid": uuid,
        "event_name": event_name,
        "created_at": created_at,
    })
}

pub fn record(offset: i64, payload: &Value) -> StreamRecord {
    record_on(0, offset, payload)
}

pub fn record_on(partition: i32, offset: i64, payload: &Value) -> StreamRecord {
    StreamRecord::new(
        RecordId::new(TEST_TOPIC, partition, offset),
        Some(payload.to_string().into_bytes()),
    )
}

pub fn raw_record(offset: i64, payload: &[u8]) -> StreamRecord {
    StreamRecord::new(RecordId::new(TEST_TOPIC, 0, offset), Some(payload.to_vec()))
}
