//! In-process dedup store for tests and local runs.
//!
//! The atomicity only holds within one process, so this must never back a deployment
//! with more than one pipeline instance.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;

use super::{DedupRecord, DedupStore, InsertOutcome};

#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    records: Arc<DashMap<String, DedupRecord>>,
    // Errors returned by the next calls, front first
    injected_errors: Arc<Mutex<VecDeque<StoreError>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `error` before touching the map.
    pub fn fail_next(self, count: usize, error: StoreError) -> Self {
        if let Ok(mut errors) = self.injected_errors.lock() {
            errors.extend(std::iter::repeat(error).take(count));
        }
        self
    }

    pub fn contains(&self, event_uuid: &str) -> bool {
        self.records.contains_key(event_uuid)
    }

    pub fn get(&self, event_uuid: &str) -> Option<DedupRecord> {
        self.records.get(event_uuid).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_injected_error(&self) -> Option<StoreError> {
        self.injected_errors
            .lock()
            .ok()
            .and_then(|mut errors| errors.pop_front())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn insert_if_absent(&self, record: &DedupRecord) -> Result<InsertOutcome, StoreError> {
        if let Some(error) = self.next_injected_error() {
            return Err(error);
        }

        match self.records.entry(record.event_uuid.clone()) {
            Entry::Occupied(occupied) if occupied.get().claim_id == record.claim_id => {
                Ok(InsertOutcome::Inserted)
            }
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }
}
