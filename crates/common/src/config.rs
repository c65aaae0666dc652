use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Outbound HTTP connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Maximum number of requests in flight at once. Excess requests wait
    /// in FIFO order for a free slot.
    pub max_concurrent: usize,
    /// Upper bound on callers waiting for admission. Beyond it `fetch`
    /// fails fast with a queue overflow error.
    pub max_pending: usize,
    /// Idle keep-alive sockets kept per host
    pub max_idle_per_host: usize,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub keep_alive: bool,
    /// Per-request timeout used when the caller does not set one
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retries after the first attempt used when the caller does not set one
    pub default_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// How long `shutdown` waits for in-flight requests
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            max_pending: 1_000,
            max_idle_per_host: 50,
            idle_timeout: Duration::from_secs(60),
            keep_alive: true,
            request_timeout: Duration::from_secs(30),
            default_retries: 3,
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Headless browser pool settings
///
/// Instances are not kept forever. The reclamation task closes idle
/// instances after `max_idle_time` and any idle instance older than
/// `max_lifetime`, which keeps long-lived Chrome processes from creeping
/// in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserPoolConfig {
    pub max_browsers: usize,
    /// How long `acquire` waits for a free instance when the pool is full
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,
    pub headless: bool,
    /// Chrome's namespace sandbox needs SYS_ADMIN inside containers. Only
    /// disable it when the container itself provides isolation.
    pub in_container: bool,
    pub disable_images: bool,
    pub viewport: (u32, u32),
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,
    /// Path to browser binary. If None, headless_chrome auto-detects one.
    pub browser_path: Option<PathBuf>,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: 3,
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            reclaim_interval: Duration::from_secs(60),
            headless: true,
            in_container: false,
            disable_images: true,
            viewport: (1366, 768),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(15),
            browser_path: None,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs executing at once. Kept small because each job may hold a
    /// browser lease.
    pub concurrency: usize,
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            default_max_retries: 2,
        }
    }
}

/// TTL and capacity for one cache class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheClassConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub search: CacheClassConfig,
    pub stats: CacheClassConfig,
    pub suggestions: CacheClassConfig,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Estimated footprint above which the sweep clears every class
    pub max_memory_bytes: usize,
    /// Shared cache tier. None runs with the local tier only.
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    #[serde(with = "humantime_serde")]
    pub redis_connect_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search: CacheClassConfig {
                ttl: Duration::from_secs(30 * 60),
                max_keys: 500,
            },
            stats: CacheClassConfig {
                ttl: Duration::from_secs(60 * 60),
                max_keys: 2_000,
            },
            suggestions: CacheClassConfig {
                ttl: Duration::from_secs(24 * 3600),
                max_keys: 500,
            },
            sweep_interval: Duration::from_secs(3600),
            max_memory_bytes: 256 * 1024 * 1024,
            redis_url: None,
            redis_prefix: "ad-radar:".to_string(),
            redis_connect_timeout: Duration::from_secs(5),
        }
    }
}

/// How a page is fetched by stats jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStrategy {
    /// Plain HTTP first, browser when the static page carries no stats
    #[default]
    HttpThenBrowser,
    HttpOnly,
    BrowserOnly,
}

impl FromStr for FetchStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http_then_browser" | "auto" => Ok(Self::HttpThenBrowser),
            "http_only" | "http" => Ok(Self::HttpOnly),
            "browser_only" | "browser" => Ok(Self::BrowserOnly),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Base URL of the ad library, e.g. https://www.facebook.com/ads/library/
    pub ad_library_url: String,
    pub fetch_strategy: FetchStrategy,
    /// Priority given to requests that do not specify one
    pub default_priority: i32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            ad_library_url: "https://www.facebook.com/ads/library/".to_string(),
            fetch_strategy: FetchStrategy::default(),
            default_priority: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub connection_pool: ConnectionPoolConfig,
    pub browser_pool: BrowserPoolConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub scraper: ScraperConfig,
    /// Port of the telemetry HTTP server (/metrics, /stats, /health)
    pub telemetry_port: u16,
}

impl AppConfig {
    /// Build the configuration from `AD_RADAR_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self {
            telemetry_port: env_or("AD_RADAR_TELEMETRY_PORT", 9090),
            ..Self::default()
        };

        let pool = &mut config.connection_pool;
        pool.max_concurrent = env_or("AD_RADAR_HTTP_MAX_CONCURRENT", pool.max_concurrent);
        pool.max_pending = env_or("AD_RADAR_HTTP_MAX_PENDING", pool.max_pending);
        pool.request_timeout = env_secs("AD_RADAR_HTTP_TIMEOUT_SECS", pool.request_timeout);
        pool.default_retries = env_or("AD_RADAR_HTTP_RETRIES", pool.default_retries);

        let browsers = &mut config.browser_pool;
        browsers.max_browsers = env_or("AD_RADAR_MAX_BROWSERS", browsers.max_browsers);
        browsers.acquire_timeout =
            env_secs("AD_RADAR_BROWSER_ACQUIRE_TIMEOUT_SECS", browsers.acquire_timeout);
        browsers.max_idle_time = env_secs("AD_RADAR_BROWSER_MAX_IDLE_SECS", browsers.max_idle_time);
        browsers.max_lifetime =
            env_secs("AD_RADAR_BROWSER_MAX_LIFETIME_SECS", browsers.max_lifetime);
        browsers.headless = env_or("AD_RADAR_BROWSER_HEADLESS", browsers.headless);
        // Docker and Kubernetes both leave a marker we can rely on
        browsers.in_container = env_or(
            "AD_RADAR_IN_CONTAINER",
            std::path::Path::new("/.dockerenv").exists()
                || env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        );
        browsers.browser_path = env::var("AD_RADAR_BROWSER_PATH").ok().map(PathBuf::from);
        if let Ok(ua) = env::var("AD_RADAR_USER_AGENT") {
            browsers.user_agent = ua;
        }

        config.queue.concurrency = env_or("AD_RADAR_QUEUE_CONCURRENCY", config.queue.concurrency);
        config.queue.default_max_retries =
            env_or("AD_RADAR_QUEUE_MAX_RETRIES", config.queue.default_max_retries);

        let cache = &mut config.cache;
        cache.stats.ttl = env_secs("AD_RADAR_STATS_TTL_SECS", cache.stats.ttl);
        cache.search.ttl = env_secs("AD_RADAR_SEARCH_TTL_SECS", cache.search.ttl);
        cache.suggestions.ttl = env_secs("AD_RADAR_SUGGESTIONS_TTL_SECS", cache.suggestions.ttl);
        cache.max_memory_bytes = env_or("AD_RADAR_CACHE_MAX_MEMORY_BYTES", cache.max_memory_bytes);
        cache.redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

        if let Ok(url) = env::var("AD_RADAR_AD_LIBRARY_URL") {
            config.scraper.ad_library_url = url;
        }
        config.scraper.fetch_strategy = env::var("AD_RADAR_FETCH_STRATEGY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        config
    }

    /// Reject combinations the components cannot work with.
    pub fn validate(&self) -> Result<(), crate::ScrapeError> {
        if self.connection_pool.max_concurrent == 0 {
            return Err(crate::ScrapeError::Config(
                "connection pool max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.browser_pool.max_browsers == 0 {
            return Err(crate::ScrapeError::Config(
                "browser pool max_browsers must be at least 1".to_string(),
            ));
        }
        if self.queue.concurrency == 0 {
            return Err(crate::ScrapeError::Config(
                "queue concurrency must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.scraper.ad_library_url).map_err(|e| {
            crate::ScrapeError::Config(format!(
                "invalid ad library url '{}': {}",
                self.scraper.ad_library_url, e
            ))
        })?;
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}, using default", name, value);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(name, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = AppConfig::default();
        assert_eq!(config.connection_pool.max_concurrent, 100);
        assert_eq!(config.connection_pool.request_timeout, Duration::from_secs(30));
        assert_eq!(config.browser_pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.browser_pool.max_browsers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fetch_strategy_from_str() {
        assert_eq!("http".parse::<FetchStrategy>(), Ok(FetchStrategy::HttpOnly));
        assert_eq!(
            "BROWSER_ONLY".parse::<FetchStrategy>(),
            Ok(FetchStrategy::BrowserOnly)
        );
        assert!("bogus".parse::<FetchStrategy>().is_err());
    }

    #[test]
    fn test_config_serializes_durations_as_humantime() {
        let json = serde_json::to_value(QueueConfig::default()).unwrap();
        assert_eq!(json["concurrency"], 2);

        let cache = serde_json::to_value(CacheConfig::default()).unwrap();
        assert_eq!(cache["stats"]["ttl"], "1h");
    }
}
