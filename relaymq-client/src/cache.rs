//! Keyed lazy cache whose values are constructed at most once

use crate::error::RelaymqClientError;
use crate::Result;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Map from name to a lazily constructed value.
///
/// Concurrent first requests for one key share a single construction; the
/// others wait for it and receive the same value. A failed construction
/// leaves the key empty so a later request retries.
///
/// Every in-flight construction holds the gate shared; [`OnceMap::drain`]
/// takes it exclusively, so draining waits for those constructions to finish
/// and hands back what they produced. Constructions requested after a drain
/// fail with [`RelaymqClientError::Closed`].
#[derive(Debug)]
pub struct OnceMap<V> {
    entries: DashMap<String, Arc<OnceCell<V>>>,
    gate: RwLock<bool>,
}

impl<V: Clone> OnceMap<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            gate: RwLock::new(false),
        }
    }

    /// Fast path: an already constructed value, without waiting
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Get the value for `key`, running `init` once if it is missing
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let gate = self.gate.read().await;
        if *gate {
            return Err(RelaymqClientError::Closed);
        }

        let cell = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = cell.get_or_try_init(init).await?.clone();
        drop(gate);
        Ok(value)
    }

    /// Close the map and remove every constructed value
    pub async fn drain(&self) -> Vec<V> {
        let mut gate = self.gate.write().await;
        *gate = true;

        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect()
    }

    /// Check if the map has been drained
    pub async fn is_closed(&self) -> bool {
        *self.gate.read().await
    }

    /// Constructed values, in no particular order
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter_map(|e| e.value().get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for OnceMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
