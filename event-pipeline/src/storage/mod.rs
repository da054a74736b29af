//! Partition writer: one JSON object per event under a deterministic key.

pub mod memory;
pub mod s3;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WriteError;
use crate::event::NormalizedEvent;
use crate::metrics_consts::{OBJECT_WRITES_COUNTER, OBJECT_WRITE_DURATION_MS};
use crate::retry::RetryPolicy;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Storage path of a single event.
///
/// Only built from a `NormalizedEvent`, whose fields are already checked to be free
/// of path separators, so every key maps to exactly one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    event_type: String,
    year: i32,
    month: u32,
    day: u32,
    event_subtype: String,
    event_uuid: String,
}

impl PartitionKey {
    pub fn for_event(event: &NormalizedEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            year: event.year(),
            month: event.month(),
            day: event.day(),
            event_subtype: event.event_subtype.clone(),
            event_uuid: event.event_uuid.clone(),
        }
    }

    /// The full object key, under `prefix` when one is configured.
    pub fn object_key(&self, prefix: Option<&str>) -> String {
        match prefix.map(|p| p.trim_end_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{self}"),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event_type={}/year={:04}/month={:02}/day={:02}/event_subtype={}/{}.json",
            self.event_type, self.year, self.month, self.day, self.event_subtype, self.event_uuid
        )
    }
}

/// Key-addressed object storage. `put_json` is an upsert: writing the same key twice
/// leaves one object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), WriteError>;
}

#[derive(Clone)]
pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
    key_prefix: Option<String>,
    retry_policy: RetryPolicy,
}

impl PartitionWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        key_prefix: Option<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            key_prefix,
            retry_policy,
        }
    }

    /// Serialize `event` and write it under its partition key, returning the key.
    pub async fn write(&self, event: &NormalizedEvent) -> Result<String, WriteError> {
        let key = PartitionKey::for_event(event).object_key(self.key_prefix.as_deref());
        let body = event
            .to_json_bytes()
            .map_err(|e| WriteError::Serialize(e.to_string()))?;

        let start = Instant::now();
        let result = self
            .retry_policy
            .retry("object_write", || self.store.put_json(&key, body.clone()))
            .await;
        metrics::histogram!(OBJECT_WRITE_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);

        match result {
            Ok(()) => {
                metrics::counter!(OBJECT_WRITES_COUNTER, "status" => "success").increment(1);
                debug!(key = %key, event_uuid = %event.event_uuid, "wrote event");
                Ok(key)
            }
            Err(e) => {
                metrics::counter!(OBJECT_WRITES_COUNTER, "status" => "failure").increment(1);
                Err(e)
            }
        }
    }
}
