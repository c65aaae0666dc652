use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use ad_radar_common::CacheClassConfig;

struct CacheEntry<V> {
    value: V,
    inserted: Instant,
    ttl: Duration,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) >= self.ttl
    }
}

/// Process-local cache for one data class.
///
/// Entries live in an `IndexMap` ordered from least to most recently used,
/// so eviction at the key ceiling pops the front. Expired entries are
/// dropped lazily on read and in bulk by `purge_expired`.
pub struct MemoryCache<V> {
    name: &'static str,
    entries: Mutex<IndexMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    max_keys: usize,
}

impl<V: Clone + Serialize> MemoryCache<V> {
    pub fn new(name: &'static str, config: CacheClassConfig) -> Self {
        Self {
            name,
            entries: Mutex::new(IndexMap::new()),
            default_ttl: config.ttl,
            max_keys: config.max_keys.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries();
        let now = Instant::now();

        let entry = entries.shift_remove(key)?;
        if entry.is_expired(now) {
            return None;
        }

        // Re-insert at the back: most recently used
        let value = entry.value.clone();
        entries.insert(key.to_string(), entry);
        Some(value)
    }

    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let size_bytes = key.len()
            + serde_json::to_vec(&value)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
        let entry = CacheEntry {
            value,
            inserted: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            size_bytes,
        };

        let mut entries = self.entries();
        entries.shift_remove(key);
        entries.insert(key.to_string(), entry);

        while entries.len() > self.max_keys {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                tracing::debug!(cache = self.name, key = %evicted, "Evicted least recently used entry");
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries().shift_remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Approximate bytes held: keys plus JSON-encoded values.
    pub fn estimated_bytes(&self) -> usize {
        self.entries().values().map(|e| e.size_bytes).sum()
    }
}
