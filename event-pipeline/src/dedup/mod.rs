//! Deduplication gate.
//!
//! The gate owns no state of its own. Every decision is a conditional insert into an
//! external store keyed by `event_uuid`, so concurrent shard workers and other
//! pipeline instances all agree on which delivery of an event got in first.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics_consts::{DEDUP_DECISIONS, DEDUP_STORE_ERRORS};
use crate::retry::RetryPolicy;

pub use memory::MemoryDedupStore;
pub use postgres::PgDedupStore;

/// The marker row kept per admitted event.
///
/// `claim_id` is fresh for every `DedupGate::admit` call and shared by all of its
/// retries, so a retry can tell its own earlier insert apart from another delivery's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub event_uuid: String,
    pub claim_id: Uuid,
    pub first_seen_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn new(event_uuid: impl Into<String>) -> Self {
        Self {
            event_uuid: event_uuid.into(),
            claim_id: Uuid::new_v4(),
            first_seen_at: Utc::now(),
        }
    }
}

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// A durable key-value store with atomic insert-if-absent semantics.
///
/// Implementations must provide the atomicity themselves: two concurrent calls for
/// the same `event_uuid` from any number of processes must yield exactly one
/// `Inserted`. A call whose record carries the `claim_id` already stored for that
/// uuid also yields `Inserted`: an earlier attempt of the same claim committed but
/// its acknowledgement was lost.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn insert_if_absent(&self, record: &DedupRecord) -> Result<InsertOutcome, StoreError>;
}

/// Decision returned by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First delivery of this event: the caller must write it.
    Admitted,
    /// Already recorded: the caller skips the write and acknowledges the record.
    Duplicate,
}

impl Admission {
    pub fn as_label(&self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::Duplicate => "duplicate",
        }
    }
}

/// Wraps a `DedupStore` with retries and per-call timeouts.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn DedupStore>,
    retry_policy: RetryPolicy,
}

impl DedupGate {
    pub fn new(store: Arc<dyn DedupStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    /// Try to claim `event_uuid`. Transient store failures are retried with backoff;
    /// the last `StoreError` is returned once attempts are exhausted.
    ///
    /// All attempts insert the same record, so an attempt that timed out after
    /// committing is recognised by the next one instead of reading as a duplicate.
    pub async fn admit(&self, event_uuid: &str) -> Result<Admission, StoreError> {
        let record = DedupRecord::new(event_uuid);

        let outcome = self
            .retry_policy
            .retry("dedup_insert", || self.store.insert_if_absent(&record))
            .await
            .inspect_err(|_| {
                metrics::counter!(DEDUP_STORE_ERRORS).increment(1);
            })?;

        let admission = match outcome {
            InsertOutcome::Inserted => Admission::Admitted,
            InsertOutcome::AlreadyExists => Admission::Duplicate,
        };

        debug!(event_uuid, admission = admission.as_label(), "dedup decision");
        metrics::counter!(DEDUP_DECISIONS, "decision" => admission.as_label()).increment(1);

        Ok(admission)
    }
}
