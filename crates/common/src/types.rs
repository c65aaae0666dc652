use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, ScrapeError};

/// Normalized statistics for one advertiser page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiserStats {
    pub page_id: String,
    pub advertiser_name: String,
    pub total_active_ads: u64,
    /// Unix milliseconds of the fetch that produced these numbers
    pub last_updated: i64,
}

/// Outcome of `get_advertiser_stats`. Always carries the execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AdvertiserStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub from_cache: bool,
    pub execution_time_ms: u64,
}

impl StatsResult {
    pub fn ok(stats: AdvertiserStats, from_cache: bool, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            stats: Some(stats),
            error: None,
            error_kind: None,
            from_cache,
            execution_time_ms,
        }
    }

    pub fn failed(error: &ScrapeError, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stats: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            from_cache: false,
            execution_time_ms,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(FailureKind::Cancelled)
    }
}

/// Ad search parameters. `offset` and `limit` only paginate the cached
/// result set; they never take part in the cache key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: String,
    pub country: String,
    /// "all", "political_and_issue_ads", ...
    #[serde(default)]
    pub ad_type: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One ad card extracted from a search results page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdSummary {
    pub ad_id: String,
    pub page_id: Option<String>,
    pub page_name: Option<String>,
    pub body: Option<String>,
    pub started_running: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub ads: Vec<AdSummary>,
    /// Result count reported by the site, which may exceed `ads.len()`
    pub total_reported: Option<u64>,
}

impl SearchResults {
    /// Slice a cached full result set for one page of a request.
    pub fn page(&self, offset: usize, limit: Option<usize>) -> SearchResults {
        let ads = self
            .ads
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        SearchResults {
            ads,
            total_reported: self.total_reported,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<SearchResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub from_cache: bool,
    pub execution_time_ms: u64,
}

/// AI-derived keyword suggestions, stored opaquely
pub type AiSuggestions = serde_json::Value;

/// Aggregated telemetry consumed by monitoring collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub active_connections: usize,
    pub queued_requests: usize,
    pub batch_queue_size: usize,
    pub avg_response_time: f64,
    pub total_requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub max_browsers: usize,
    pub total_created: u64,
    pub total_recycled: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub concurrency_limit: usize,
}
