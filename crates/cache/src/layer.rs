use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ad_radar_common::keys::{self, SEARCH_PREFIX, STATS_PREFIX, SUGGESTIONS_PREFIX};
use ad_radar_common::{AdvertiserStats, AiSuggestions, CacheConfig, SearchQuery, SearchResults};

use crate::memory::MemoryCache;
use crate::remote::RemoteCache;

/// Two-tier cache for scrape results, advertiser stats and AI suggestions.
///
/// Reads try the process-local tier first, then the shared tier; shared
/// hits are copied into the local tier. Writes go to both tiers.
pub struct CacheLayer {
    search: MemoryCache<SearchResults>,
    stats: MemoryCache<AdvertiserStats>,
    suggestions: MemoryCache<AiSuggestions>,
    remote: RemoteCache,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<CancellationToken>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub keys: usize,
    pub search_keys: usize,
    pub stats_keys: usize,
    pub suggestion_keys: usize,
    pub estimated_bytes: usize,
    pub remote_available: bool,
}

/// Data classes with independent TTL and capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    Search,
    Stats,
    Suggestions,
}

impl CacheClass {
    fn key_prefix(&self) -> &'static str {
        match self {
            Self::Search => SEARCH_PREFIX,
            Self::Stats => STATS_PREFIX,
            Self::Suggestions => SUGGESTIONS_PREFIX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub force_cleared: bool,
}

impl CacheLayer {
    pub fn new(config: CacheConfig, remote: RemoteCache) -> Self {
        Self {
            search: MemoryCache::new("search", config.search),
            stats: MemoryCache::new("stats", config.stats),
            suggestions: MemoryCache::new("suggestions", config.suggestions),
            remote,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Build the layer, connecting the shared tier when a Redis URL is set.
    pub async fn connect(config: CacheConfig) -> Self {
        let remote = match config.redis_url.as_deref() {
            Some(url) => {
                RemoteCache::connect(url, &config.redis_prefix, config.redis_connect_timeout).await
            }
            None => {
                info!("No REDIS_URL configured - running with the local cache tier only");
                RemoteCache::disabled()
            }
        };
        Self::new(config, remote)
    }

    async fn lookup<V>(&self, class: &MemoryCache<V>, key: &str) -> Option<V>
    where
        V: Clone + Serialize + DeserializeOwned,
    {
        if let Some(value) = class.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = class.name(), key = %key, "Cache hit (local)");
            return Some(value);
        }

        if let Some(entry) = self.remote.get::<V>(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            // The local copy must not outlive the shared one
            let ttl = entry
                .ttl
                .map_or(class.default_ttl(), |left| left.min(class.default_ttl()));
            debug!(cache = class.name(), key = %key, ttl = ?ttl, "Cache hit (shared)");
            class.set(key, entry.value.clone(), Some(ttl));
            return Some(entry.value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache = class.name(), key = %key, "Cache miss");
        None
    }

    async fn store<V>(&self, class: &MemoryCache<V>, key: &str, value: V, ttl: Option<Duration>)
    where
        V: Clone + Serialize,
    {
        let ttl = ttl.unwrap_or(class.default_ttl());
        self.remote.set(key, &value, ttl).await;
        class.set(key, value, Some(ttl));
    }

    pub async fn get_stats(&self, page_id: &str, country: &str) -> Option<AdvertiserStats> {
        self.lookup(&self.stats, &keys::stats_key(page_id, country))
            .await
    }

    pub async fn set_stats(&self, country: &str, stats: &AdvertiserStats) {
        let key = keys::stats_key(&stats.page_id, country);
        self.store(&self.stats, &key, stats.clone(), None).await;
    }

    pub async fn get_search(&self, query: &SearchQuery) -> Option<SearchResults> {
        self.lookup(&self.search, &keys::search_key(query)).await
    }

    pub async fn set_search(&self, query: &SearchQuery, results: &SearchResults) {
        let key = keys::search_key(query);
        self.store(&self.search, &key, results.clone(), None).await;
    }

    pub async fn get_suggestions(&self, keywords: &[String]) -> Option<AiSuggestions> {
        self.lookup(&self.suggestions, &keys::suggestions_key(keywords))
            .await
    }

    pub async fn set_suggestions(
        &self,
        keywords: &[String],
        suggestions: AiSuggestions,
        ttl: Option<Duration>,
    ) {
        let key = keys::suggestions_key(keywords);
        self.store(&self.suggestions, &key, suggestions, ttl).await;
    }

    /// Clear every class in both tiers.
    pub async fn clear(&self) {
        self.clear_local();
        for class in [CacheClass::Stats, CacheClass::Search, CacheClass::Suggestions] {
            self.remote.clear(&format!("{}:", class.key_prefix())).await;
        }
        info!("All cache classes cleared");
    }

    /// Clear one class in both tiers.
    pub async fn clear_class(&self, class: CacheClass) {
        match class {
            CacheClass::Search => self.search.clear(),
            CacheClass::Stats => self.stats.clear(),
            CacheClass::Suggestions => self.suggestions.clear(),
        }
        self.remote
            .clear(&format!("{}:", class.key_prefix()))
            .await;
        info!("Cache class {:?} cleared", class);
    }

    fn clear_local(&self) {
        self.search.clear();
        self.stats.clear();
        self.suggestions.clear();
    }

    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.search.len() + self.stats.len() + self.suggestions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn estimated_bytes(&self) -> usize {
        self.search.estimated_bytes()
            + self.stats.estimated_bytes()
            + self.suggestions.estimated_bytes()
    }

    pub fn stats(&self) -> CacheStats {
        let search_keys = self.search.len();
        let stats_keys = self.stats.len();
        let suggestion_keys = self.suggestions.len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            keys: search_keys + stats_keys + suggestion_keys,
            search_keys,
            stats_keys,
            suggestion_keys,
            estimated_bytes: self.estimated_bytes(),
            remote_available: self.remote.is_available(),
        }
    }

    /// One sweep pass: drop expired entries, report, and clear the local
    /// tier when its estimated footprint is over the safety threshold.
    pub fn sweep(&self) -> SweepReport {
        let expired = self.search.purge_expired()
            + self.stats.purge_expired()
            + self.suggestions.purge_expired();
        let stats = self.stats();

        info!(
            "Cache sweep: {} keys ({} search, {} stats, {} suggestions), ~{} KiB, hit rate {:.1}%, {} expired",
            stats.keys,
            stats.search_keys,
            stats.stats_keys,
            stats.suggestion_keys,
            stats.estimated_bytes / 1024,
            stats.hit_rate * 100.0,
            expired
        );

        let force_cleared = stats.estimated_bytes > self.config.max_memory_bytes;
        if force_cleared {
            warn!(
                "Cache footprint ~{} bytes exceeds limit of {} bytes - clearing local tier",
                stats.estimated_bytes, self.config.max_memory_bytes
            );
            self.clear_local();
        }

        SweepReport {
            expired,
            force_cleared,
        }
    }

    /// Run `sweep` every `sweep_interval` until `stop_sweeper` is called.
    pub fn start_sweeper(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let layer = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        layer.sweep();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        });
    }

    pub fn stop_sweeper(&self) {
        if let Some(token) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}
