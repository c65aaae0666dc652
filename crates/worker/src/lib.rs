mod browser_pool;
mod chrome;
mod connection_pool;
mod extract;
mod handlers;
mod launch_args;
mod metrics;
mod service;

pub use browser_pool::{BrowserLauncher, BrowserLease, BrowserPool, BrowserSession};
pub use chrome::{BinaryStatus, ChromeLauncher};
pub use connection_pool::{ConnectionPool, ConnectionStats, FetchRequest};
pub use extract::{extract_ads, extract_page_stats, extract_result_count, PageStats};
pub use handlers::{page_url, search_url, ScrapeHandler, StatsFetchHandler};
pub use launch_args::chrome_args;
pub use metrics::{Metrics, TelemetrySnapshot};
pub use service::{ScraperService, SearchRequest, StatsRequest};

use ad_radar_cache::CacheLayer;
use ad_radar_common::AppConfig;
use ad_radar_queue::JobQueue;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the scraping core until SIGINT or SIGTERM.
///
/// Components are started bottom-up (cache, connection pool, browser
/// pool, queue, service, telemetry) and torn down in reverse dependency
/// order so no job outlives the pools it uses.
///
/// # Example
///
/// ```rust,ignore
/// use ad_radar_common::AppConfig;
/// use ad_radar_worker::run_worker;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_worker(AppConfig::from_env()).await
/// }
/// ```
pub async fn run_worker(config: AppConfig) -> Result<()> {
    config.validate()?;
    info!(
        "Starting ad-radar worker (browsers: {}, queue concurrency: {}, telemetry port: {})",
        config.browser_pool.max_browsers, config.queue.concurrency, config.telemetry_port
    );

    let cache = Arc::new(CacheLayer::connect(config.cache.clone()).await);
    cache.start_sweeper();

    let connections = Arc::new(ConnectionPool::new(
        config.connection_pool.clone(),
        &config.browser_pool.user_agent,
    )?);

    let launcher = Arc::new(ChromeLauncher::new(&config.browser_pool));
    let browsers = Arc::new(BrowserPool::new(config.browser_pool.clone(), launcher));
    browsers.start_reclaimer();

    let queue = JobQueue::new(&config.queue);
    let service = Arc::new(ScraperService::new(
        Arc::clone(&cache),
        queue.clone(),
        Arc::clone(&browsers),
        Arc::clone(&connections),
        config.scraper.clone(),
    ));

    let telemetry_shutdown = CancellationToken::new();
    let metrics = Metrics::new("ad-radar")?;
    let mut telemetry_handle = tokio::spawn(metrics.start_server(
        config.telemetry_port,
        Arc::clone(&service),
        telemetry_shutdown.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut telemetry_handle => {
            match result {
                Ok(Ok(())) => warn!("Telemetry server exited unexpectedly"),
                Ok(Err(e)) => error!("Telemetry server error: {}", e),
                Err(e) => error!("Telemetry server task failed: {}", e),
            }
        }
    }

    // Cancel queued and running jobs first so they release leases and permits
    let cancelled = queue.shutdown();
    info!("Cancelled {} outstanding job(s)", cancelled);
    wait_for_jobs(&queue, Duration::from_secs(10)).await;

    let remaining = connections.shutdown().await;
    if remaining > 0 {
        warn!(
            "Terminating with {} HTTP request(s) still running",
            remaining
        );
    }
    browsers.shutdown().await;
    cache.stop_sweeper();

    telemetry_shutdown.cancel();
    if !telemetry_handle.is_finished() {
        if let Err(e) = telemetry_handle.await {
            warn!("Telemetry server task failed during shutdown: {}", e);
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Wait until no job is executing, checking every 500ms.
async fn wait_for_jobs(queue: &JobQueue, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let active = queue.stats().active;
        if active == 0 {
            info!("All jobs completed");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Terminating with {} job(s) still running", active);
            break;
        }
        info!("Waiting for {} job(s) to complete...", active);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }
    info!("Starting graceful shutdown");
}
