//! In-memory store and cache backends.
//!
//! Used by the test suites and for running a single API instance without
//! Postgres or Redis. Both are cheaply cloneable; clones share their data.
//!
//! # Limitations
//!
//! - Nothing survives a restart
//! - Cache expiry is checked lazily on read, there is no sweeper

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{
    cache::{CacheResult, SharedCache},
    store::{DurableStore, EntityKey, Query, StoreResult},
};

/// In-memory [`DurableStore`] keyed in [`EntityKey`] order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<EntityKey, Value>>>,
    sequences: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all kinds.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &EntityKey) -> StoreResult<Option<Value>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &EntityKey, doc: Value) -> StoreResult<()> {
        self.data.write().insert(key.clone(), doc);
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> StoreResult<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn allocate_id(&self, kind: &str) -> StoreResult<i64> {
        let mut sequences = self.sequences.lock();
        let next = sequences.entry(kind.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<(EntityKey, Value)>> {
        let data = self.data.read();
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(data
            .iter()
            .filter(|(key, doc)| key.kind == query.kind && query.matches(doc))
            .take(limit)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect())
    }

    async fn count(&self, query: &Query) -> StoreResult<usize> {
        let data = self.data.read();
        Ok(data
            .iter()
            .filter(|(key, doc)| key.kind == query.kind && query.matches(doc))
            .count())
    }
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`SharedCache`] with per-entry expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, as a cache eviction would.
    pub fn flush(&self) {
        self.entries.write().clear();
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: remove it so the map does not grow without bound.
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .write()
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .write()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }
}
