//! Self-populating per-table cache.
//!
//! A [`LoadingCache`] holds type-erased values in a concurrent map and calls
//! its [`CacheLoader`] on a miss. Capacity is unlimited. When a
//! refresh-after-write duration is configured, a read of an entry older than
//! that duration reloads it inline and keeps the previous value if the reload
//! fails. Concurrent misses on one key may each call the loader.
//!
//! Every invalidation bumps a generation counter. A value loaded while the
//! generation moved is returned to its caller but not cached, so a load
//! racing a delete cannot resurrect the deleted entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};
use xconf_core::XconfResult;

use super::stats::CacheCounters;
use crate::registry::CachedObject;

/// Source of truth behind a [`LoadingCache`].
///
/// Implementations may only fail with NotFound-class or store errors.
#[async_trait]
pub trait CacheLoader: Send + Sync {
    async fn load(&self, key: &str) -> XconfResult<CachedObject>;

    async fn load_all(&self) -> XconfResult<HashMap<String, CachedObject>>;
}

#[derive(Clone)]
struct CacheEntry {
    value: CachedObject,
    written_at: Instant,
}

impl CacheEntry {
    fn new(value: CachedObject) -> Self {
        Self {
            value,
            written_at: Instant::now(),
        }
    }
}

pub struct LoadingCache {
    name: String,
    entries: DashMap<String, CacheEntry>,
    loader: Arc<dyn CacheLoader>,
    refresh_after_write: Option<Duration>,
    counters: CacheCounters,
    generation: AtomicU64,
}

impl std::fmt::Debug for LoadingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache")
            .field("name", &self.name)
            .field("size", &self.entries.len())
            .field("refresh_after_write", &self.refresh_after_write)
            .finish()
    }
}

impl LoadingCache {
    pub fn new(name: impl Into<String>, loader: Arc<dyn CacheLoader>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            loader,
            refresh_after_write: None,
            generation: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    pub fn with_refresh_after_write(mut self, duration: Option<Duration>) -> Self {
        self.refresh_after_write = duration;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Cached value, loading it on a miss.
    pub async fn get(&self, key: &str) -> XconfResult<CachedObject> {
        // Copy out of the map so no shard guard is held across an await.
        let cached = self.entries.get(key).map(|e| e.value().clone());

        let Some(entry) = cached else {
            self.counters.record_miss();
            trace!(table = %self.name, key = %key, "Cache miss");
            let generation = self.generation();
            let value = self.load_timed(key).await?;
            self.insert_if_current(key, value.clone(), generation);
            return Ok(value);
        };

        self.counters.record_hit();
        if self.is_stale(&entry) {
            let generation = self.generation();
            match self.load_timed(key).await {
                Ok(fresh) => {
                    self.insert_if_current(key, fresh.clone(), generation);
                    return Ok(fresh);
                }
                Err(e) => {
                    debug!(table = %self.name, key = %key, error = %e, "Reload of stale entry failed, serving previous value");
                }
            }
        }
        Ok(entry.value)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn insert_if_current(&self, key: &str, value: CachedObject, generation: u64) {
        if self.generation() == generation {
            self.entries.insert(key.to_string(), CacheEntry::new(value));
        } else {
            trace!(table = %self.name, key = %key, "Invalidated during load, not caching");
        }
    }

    /// Cached value without loading.
    pub fn get_if_present(&self, key: &str) -> Option<CachedObject> {
        match self.entries.get(key) {
            Some(entry) => {
                self.counters.record_hit();
                Some(entry.value.clone())
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: CachedObject) {
        self.entries.insert(key.into(), CacheEntry::new(value));
    }

    pub fn put_all(&self, values: HashMap<String, CachedObject>) {
        for (key, value) in values {
            self.put(key, value);
        }
    }

    /// Replace the whole content with `values`.
    pub fn replace_all(&self, values: HashMap<String, CachedObject>) {
        self.invalidate_all();
        self.put_all(values);
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.counters.record_evictions(1);
        }
        removed
    }

    /// Remove every entry. Returns how many were removed.
    pub fn invalidate_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.entries.len();
        self.entries.clear();
        self.counters.record_evictions(removed as u64);
        removed
    }

    /// Reload one key in place.
    ///
    /// The previous value stays visible until the reload completes. A
    /// NotFound reload removes the entry and returns the error; any other
    /// error keeps the previous value.
    pub async fn refresh(&self, key: &str) -> XconfResult<()> {
        let generation = self.generation();
        match self.load_timed(key).await {
            Ok(value) => {
                self.insert_if_current(key, value, generation);
                Ok(())
            }
            Err(e) => {
                if e.is_not_found() {
                    self.invalidate(key);
                }
                Err(e)
            }
        }
    }

    /// Bulk-load every value from the loader without touching the cache.
    pub async fn load_all(&self) -> XconfResult<HashMap<String, CachedObject>> {
        let started = Instant::now();
        let result = self.loader.load_all().await;
        self.counters.record_load(started.elapsed(), result.is_ok());
        result
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<CachedObject> {
        self.entries.iter().map(|e| e.value().value.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, CachedObject)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        self.refresh_after_write
            .map(|ttl| entry.written_at.elapsed() >= ttl)
            .unwrap_or(false)
    }

    async fn load_timed(&self, key: &str) -> XconfResult<CachedObject> {
        let started = Instant::now();
        let result = self.loader.load(key).await;
        self.counters.record_load(started.elapsed(), result.is_ok());
        result
    }
}
