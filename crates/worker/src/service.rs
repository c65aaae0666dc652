use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ad_radar_cache::{CacheLayer, CacheStats};
use ad_radar_common::utils::{normalize_country, normalize_page_id};
use ad_radar_common::{
    AiSuggestions, PerformanceStats, PoolStats, QueueStats, ScrapeError, ScraperConfig,
    SearchOutcome, SearchQuery, SearchResults, StatsResult,
};
use ad_radar_queue::{
    JobKind, JobOutput, JobQueue, JobRequest, JobType, ScrapePayload, StatsFetchPayload,
};

use crate::browser_pool::BrowserPool;
use crate::connection_pool::{ConnectionPool, ConnectionStats};
use crate::handlers::{ScrapeHandler, StatsFetchHandler};

/// Parameters for an advertiser stats lookup
#[derive(Debug, Clone, Default)]
pub struct StatsRequest {
    pub page_id: String,
    pub country: String,
    /// Owner of the job; a newer request from the same user may cancel it
    pub user_id: Option<String>,
    /// Falls back to the configured default priority
    pub priority: Option<i32>,
}

impl StatsRequest {
    pub fn new(page_id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            country: country.into(),
            ..Self::default()
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: SearchQuery,
    pub user_id: Option<String>,
    pub priority: Option<i32>,
}

impl SearchRequest {
    pub fn new(query: SearchQuery) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Entry point for collaborators: cache-first lookups backed by queued
/// scrape jobs.
pub struct ScraperService {
    cache: Arc<CacheLayer>,
    queue: JobQueue,
    browsers: Arc<BrowserPool>,
    connections: Arc<ConnectionPool>,
    config: ScraperConfig,

    // Metrics
    total_requests: AtomicU64,
    errors: AtomicU64,
    /// (samples, cumulative moving average in ms)
    response_time: Mutex<(u64, f64)>,
}

impl ScraperService {
    /// Wire the components together and register the job handlers.
    pub fn new(
        cache: Arc<CacheLayer>,
        queue: JobQueue,
        browsers: Arc<BrowserPool>,
        connections: Arc<ConnectionPool>,
        config: ScraperConfig,
    ) -> Self {
        Self::with_scrape_handler(
            cache,
            queue,
            Arc::clone(&browsers),
            connections,
            config.clone(),
            ScrapeHandler::new(browsers, config),
        )
    }

    fn with_scrape_handler(
        cache: Arc<CacheLayer>,
        queue: JobQueue,
        browsers: Arc<BrowserPool>,
        connections: Arc<ConnectionPool>,
        config: ScraperConfig,
        scrape_handler: ScrapeHandler,
    ) -> Self {
        queue.register_handler(
            JobType::StatsFetch,
            Arc::new(StatsFetchHandler::new(
                Arc::clone(&connections),
                Arc::clone(&browsers),
                config.clone(),
            )),
        );
        queue.register_handler(JobType::Scrape, Arc::new(scrape_handler));

        info!(
            "Scraper service ready (fetch strategy: {:?}, library: {})",
            config.fetch_strategy, config.ad_library_url
        );

        Self {
            cache,
            queue,
            browsers,
            connections,
            config,
            total_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            response_time: Mutex::new((0, 0.0)),
        }
    }

    pub async fn get_advertiser_stats(&self, page_id: &str, country: &str) -> StatsResult {
        self.get_advertiser_stats_for(StatsRequest::new(page_id, country))
            .await
    }

    pub async fn get_advertiser_stats_for(&self, request: StatsRequest) -> StatsResult {
        let started = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let page_id = normalize_page_id(&request.page_id);
        let country = normalize_country(&request.country);
        if page_id.is_empty() {
            let error = ScrapeError::Config("page id must not be empty".to_string());
            return self.stats_failure(&error, started);
        }

        if let Some(stats) = self.cache.get_stats(&page_id, &country).await {
            debug!(page_id = %page_id, country = %country, "Serving advertiser stats from cache");
            return StatsResult::ok(stats, true, self.finish(started));
        }

        let mut job = JobRequest::new(JobKind::StatsFetch(StatsFetchPayload {
            page_id: page_id.clone(),
            country: country.clone(),
        }))
        .with_priority(request.priority.unwrap_or(self.config.default_priority));
        if let Some(user_id) = request.user_id {
            job = job.for_user(user_id);
        }

        match self.queue.submit(job).await {
            Ok(JobOutput::Stats(stats)) => {
                self.cache.set_stats(&country, &stats).await;
                StatsResult::ok(stats, false, self.finish(started))
            }
            Ok(other) => {
                let error = ScrapeError::Internal(format!("unexpected job output: {:?}", other));
                self.stats_failure(&error, started)
            }
            Err(e) => self.stats_failure(&e, started),
        }
    }

    fn stats_failure(&self, error: &ScrapeError, started: Instant) -> StatsResult {
        self.note_failure(error);
        StatsResult::failed(error, self.finish(started))
    }

    /// Search the library. The full result set is cached; `offset` and
    /// `limit` slice it afterwards.
    pub async fn search_ads(&self, request: SearchRequest) -> SearchOutcome {
        let started = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut query = request.query;
        query.country = normalize_country(&query.country);
        query.query = query.query.trim().to_string();
        let (offset, limit) = (query.offset, query.limit);

        if let Some(results) = self.cache.get_search(&query).await {
            return search_success(results.page(offset, limit), true, self.finish(started));
        }

        let mut job = JobRequest::new(JobKind::Scrape(ScrapePayload {
            query: query.clone(),
        }))
        .with_priority(request.priority.unwrap_or(self.config.default_priority));
        if let Some(user_id) = request.user_id {
            job = job.for_user(user_id);
        }

        let result = match self.queue.submit(job).await {
            Ok(JobOutput::Search(results)) => Ok(results),
            Ok(other) => Err(ScrapeError::Internal(format!(
                "unexpected job output: {:?}",
                other
            ))),
            Err(e) => Err(e),
        };

        match result {
            Ok(results) => {
                self.cache.set_search(&query, &results).await;
                search_success(results.page(offset, limit), false, self.finish(started))
            }
            Err(e) => {
                self.note_failure(&e);
                SearchOutcome {
                    success: false,
                    results: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                    from_cache: false,
                    execution_time_ms: self.finish(started),
                }
            }
        }
    }

    pub async fn get_ai_suggestions(&self, keywords: &[String]) -> Option<AiSuggestions> {
        self.cache.get_suggestions(keywords).await
    }

    /// Store suggestions computed by a collaborator. `ttl` overrides the
    /// class default.
    pub async fn put_ai_suggestions(
        &self,
        keywords: &[String],
        suggestions: AiSuggestions,
        ttl: Option<Duration>,
    ) {
        self.cache.set_suggestions(keywords, suggestions, ttl).await;
    }

    /// Cancel every outstanding job of `user_id`. Never fails.
    pub fn cancel_for_user(&self, user_id: &str) -> usize {
        self.queue.cancel_for_user(user_id)
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        let connections = self.connections.stats();
        let (_, avg) = *self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        PerformanceStats {
            cache_hit_rate: self.cache.hit_rate(),
            cache_size: self.cache.len(),
            active_connections: connections.active,
            queued_requests: connections.waiting,
            batch_queue_size: self.queue.stats().queued,
            avg_response_time: avg,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub async fn get_pool_stats(&self) -> PoolStats {
        self.browsers.stats().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connections.stats()
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Zero request, error and timing counters across components.
    pub fn reset_metrics(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (0, 0.0);
        self.cache.reset_counters();
        self.connections.reset_stats();
        info!("Performance metrics reset");
    }

    /// Cancellations are expected and are not counted as errors.
    fn note_failure(&self, error: &ScrapeError) {
        if error.is_cancelled() {
            debug!("Request superseded: {}", error);
            return;
        }
        self.errors.fetch_add(1, Ordering::Relaxed);
        if error.is_fatal() {
            warn!("Fatal scrape failure: {}", error);
        } else {
            warn!("Scrape failed: {}", error);
        }
    }

    /// Record the request duration and return it in milliseconds.
    fn finish(&self, started: Instant) -> u64 {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut average = self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (samples, mean) = *average;
        let samples = samples + 1;
        *average = (samples, mean + (elapsed_ms as f64 - mean) / samples as f64);
        elapsed_ms
    }
}

fn search_success(
    results: SearchResults,
    from_cache: bool,
    execution_time_ms: u64,
) -> SearchOutcome {
    SearchOutcome {
        success: true,
        results: Some(results),
        error: None,
        error_kind: None,
        from_cache,
        execution_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser_pool::testing::FakeLauncher;
    use ad_radar_cache::RemoteCache;
    use ad_radar_common::{
        BrowserPoolConfig, CacheConfig, ConnectionPoolConfig, FailureKind, FetchStrategy,
        QueueConfig,
    };
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    const STATS_PAGE: &str =
        r#"<div>~1,200 results</div><script>{"page_name":"Acme Shoes"}</script>"#;
    const SEARCH_PAGE: &str = r#"<div>3 results</div><script>[
        {"ad_archive_id":"1","page_name":"A"},
        {"ad_archive_id":"2","page_name":"B"},
        {"ad_archive_id":"3","page_name":"C"}]</script>"#;

    async fn library(Query(params): Query<HashMap<String, String>>) -> Response {
        match params.get("view_all_page_id").map(String::as_str) {
            Some("1") => STATS_PAGE.into_response(),
            Some("2") => "<div id=\"root\"></div>".into_response(),
            Some("500") => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Some("slow") => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                STATS_PAGE.into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    struct Harness {
        service: ScraperService,
        launcher: Arc<FakeLauncher>,
        queue: JobQueue,
    }

    async fn harness(strategy: FetchStrategy) -> Harness {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/ads/library/", get(library));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut pages = HashMap::new();
        pages.insert("view_all_page_id=2&".to_string(), STATS_PAGE.to_string());
        pages.insert("q=shoes".to_string(), SEARCH_PAGE.to_string());
        let launcher = Arc::new(FakeLauncher::with_pages(pages));

        let config = ScraperConfig {
            ad_library_url: format!("http://{}/ads/library/", addr),
            fetch_strategy: strategy,
            ..ScraperConfig::default()
        };
        let connections = Arc::new(
            ConnectionPool::new(
                ConnectionPoolConfig {
                    default_retries: 0,
                    ..ConnectionPoolConfig::default()
                },
                "TestAgent/1.0",
            )
            .unwrap(),
        );
        let browsers = Arc::new(BrowserPool::new(
            BrowserPoolConfig::default(),
            Arc::clone(&launcher) as Arc<dyn crate::browser_pool::BrowserLauncher>,
        ));
        let queue = JobQueue::new(&QueueConfig {
            concurrency: 2,
            default_max_retries: 0,
        });
        let cache = Arc::new(CacheLayer::new(CacheConfig::default(), RemoteCache::disabled()));

        let service = ScraperService::with_scrape_handler(
            cache,
            queue.clone(),
            Arc::clone(&browsers),
            connections,
            config.clone(),
            ScrapeHandler::new(browsers, config).with_scroll_passes(0),
        );
        Harness {
            service,
            launcher,
            queue,
        }
    }

    #[tokio::test]
    async fn test_second_lookup_served_from_cache() {
        let h = harness(FetchStrategy::HttpThenBrowser).await;

        let first = h.service.get_advertiser_stats("1", "us").await;
        assert!(first.success, "{:?}", first.error);
        assert!(!first.from_cache);
        let stats = first.stats.unwrap();
        assert_eq!(stats.total_active_ads, 1200);
        assert_eq!(stats.advertiser_name, "Acme Shoes");

        let second = h.service.get_advertiser_stats("1", "US").await;
        assert!(second.success);
        assert!(second.from_cache);
        assert_eq!(second.stats.as_ref().map(|s| s.total_active_ads), Some(1200));
        assert!(
            second.execution_time_ms < 50,
            "cache hit took {}ms",
            second.execution_time_ms
        );
        let json = serde_json::to_value(&second).unwrap();
        assert_eq!(json["fromCache"], true);
        assert_eq!(json["executionTimeMs"], second.execution_time_ms);
        assert_eq!(h.queue.counters().submitted, 1);
        // Static HTML was enough, no browser started
        assert_eq!(h.launcher.launches.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_browser_for_client_rendered_page() {
        let h = harness(FetchStrategy::HttpThenBrowser).await;

        let result = h.service.get_advertiser_stats("2", "ALL").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stats.unwrap().total_active_ads, 1200);
        assert_eq!(h.launcher.launches.load(std::sync::atomic::Ordering::SeqCst), 1);

        let pool = h.service.get_pool_stats().await;
        assert_eq!(pool.total, 1);
        assert_eq!(pool.in_use, 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported() {
        let h = harness(FetchStrategy::HttpOnly).await;

        let result = h.service.get_advertiser_stats("500", "ALL").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(FailureKind::Upstream));
        assert!(result.error.unwrap().contains("500"));
        assert_eq!(h.service.get_performance_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_empty_page_id_rejected_without_job() {
        let h = harness(FetchStrategy::HttpOnly).await;
        let result = h.service.get_advertiser_stats("  ", "ALL").await;
        assert!(!result.success);
        assert_eq!(h.queue.counters().submitted, 0);
    }

    #[tokio::test]
    async fn test_cancel_for_user_rejects_pending_lookup() {
        let h = Arc::new(harness(FetchStrategy::HttpOnly).await);

        let lookup = {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.service
                    .get_advertiser_stats_for(StatsRequest::new("slow", "ALL").for_user("u1"))
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.service.queue_stats().active == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.service.cancel_for_user("u2"), 0);
        assert_eq!(h.service.cancel_for_user("u1"), 1);

        let result = lookup.await.unwrap();
        assert!(!result.success);
        assert!(result.is_cancelled());
        // Superseded requests are not errors
        assert_eq!(h.service.get_performance_stats().errors, 0);
    }

    #[tokio::test]
    async fn test_search_pages_share_one_cache_entry() {
        let h = harness(FetchStrategy::HttpThenBrowser).await;
        let query = SearchQuery {
            query: "shoes".to_string(),
            country: "us".to_string(),
            limit: Some(2),
            ..Default::default()
        };

        let first = h.service.search_ads(SearchRequest::new(query.clone())).await;
        assert!(first.success, "{:?}", first.error);
        assert!(!first.from_cache);
        let page = first.results.unwrap();
        assert_eq!(page.ads.len(), 2);
        assert_eq!(page.total_reported, Some(3));

        let second = h
            .service
            .search_ads(SearchRequest::new(SearchQuery {
                offset: 2,
                ..query
            }))
            .await;
        assert!(second.from_cache);
        let page = second.results.unwrap();
        assert_eq!(page.ads.len(), 1);
        assert_eq!(page.ads[0].ad_id, "3");
        assert_eq!(h.queue.counters().submitted, 1);
    }

    #[tokio::test]
    async fn test_ai_suggestions_roundtrip() {
        let h = harness(FetchStrategy::HttpOnly).await;
        let keywords = vec!["Shoes".to_string(), "socks".to_string()];
        assert!(h.service.get_ai_suggestions(&keywords).await.is_none());

        h.service
            .put_ai_suggestions(&keywords, serde_json::json!(["sneakers"]), None)
            .await;
        let reordered = vec!["socks".to_string(), "shoes".to_string()];
        assert_eq!(
            h.service.get_ai_suggestions(&reordered).await,
            Some(serde_json::json!(["sneakers"]))
        );
    }

    #[tokio::test]
    async fn test_performance_stats_and_reset() {
        let h = harness(FetchStrategy::HttpOnly).await;
        h.service.get_advertiser_stats("1", "ALL").await;
        h.service.get_advertiser_stats("1", "ALL").await;

        let stats = h.service.get_performance_stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_size, 1);
        assert!((stats.cache_hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.batch_queue_size, 0);

        h.service.reset_metrics();
        h.service.clear_cache().await;
        let stats = h.service.get_performance_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
    }
}
