//! # Ad Radar
//!
//! Scraping core for an ad-intelligence service. It looks up advertiser
//! statistics and searches the public ad library, keeping upstream load in
//! check with bounded pools, a priority job queue and a two-tier cache.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ad_radar::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env();
//!
//!     let cache = Arc::new(CacheLayer::connect(config.cache.clone()).await);
//!     let connections = Arc::new(ConnectionPool::new(
//!         config.connection_pool.clone(),
//!         &config.browser_pool.user_agent,
//!     )?);
//!     let browsers = Arc::new(BrowserPool::new(
//!         config.browser_pool.clone(),
//!         Arc::new(ChromeLauncher::new(&config.browser_pool)),
//!     ));
//!     let service = ScraperService::new(
//!         cache,
//!         JobQueue::new(&config.queue),
//!         browsers,
//!         connections,
//!         config.scraper.clone(),
//!     );
//!
//!     let result = service.get_advertiser_stats("123456789", "US").await;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Common**: configuration, error taxonomy, result types and cache keys
//! - **Cache**: in-process LRU tier in front of an optional Redis tier
//! - **Queue**: priority job queue with retries and per-user cancellation
//! - **Worker**: connection pool, browser pool, job handlers, the
//!   `ScraperService` orchestrator and the telemetry server
//!
//! ## Features
//!
//! - `worker` (default): include the pools, the orchestrator and the
//!   runnable worker
//!
//! Use `default-features = false` to depend only on the cache and queue.

/// Re-export of shared types and configuration
pub use ad_radar_common as common;

/// Re-export of the two-tier cache
pub use ad_radar_cache as cache;

/// Re-export of the job queue
pub use ad_radar_queue as queue;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use ad_radar_worker as worker;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::common::{
        AppConfig, BrowserPoolConfig, CacheConfig, ConnectionPoolConfig, FetchStrategy,
        QueueConfig, ScraperConfig,
    };

    // Errors and results
    pub use crate::common::{
        AdvertiserStats, FailureKind, PerformanceStats, PoolStats, QueueStats, ScrapeError,
        ScrapeResult, SearchOutcome, SearchQuery, SearchResults, StatsResult,
    };

    // Cache
    pub use crate::cache::{CacheClass, CacheLayer, CacheStats};

    // Queue
    pub use crate::queue::{CancellationExt, JobHandler, JobQueue, JobRequest, JobType};

    // Worker functionality
    #[cfg(feature = "worker")]
    pub use crate::worker::{
        run_worker, BrowserPool, ChromeLauncher, ConnectionPool, Metrics, ScraperService,
        SearchRequest, StatsRequest,
    };
}
