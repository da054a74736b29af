use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::WriteError;

use super::ObjectStore;

/// Object store kept in memory, always available for tests.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, Vec<u8>>>,
    puts: Arc<AtomicUsize>,
    injected_errors: Arc<Mutex<VecDeque<WriteError>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` puts fail with `error` without storing anything.
    pub fn fail_next(self, count: usize, error: WriteError) -> Self {
        if let Ok(mut errors) = self.injected_errors.lock() {
            errors.extend(std::iter::repeat(error).take(count));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    pub fn get_json(&self, key: &str) -> Option<Value> {
        self.get(key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|o| o.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of successful puts, overwrites included.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), WriteError> {
        let injected = self
            .injected_errors
            .lock()
            .ok()
            .and_then(|mut errors| errors.pop_front());
        if let Some(error) = injected {
            return Err(error);
        }

        self.objects.insert(key.to_string(), body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
