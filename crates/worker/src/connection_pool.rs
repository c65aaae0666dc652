use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ad_radar_common::{ConnectionPoolConfig, ScrapeError, ScrapeResult};

/// One outbound request. Unset fields fall back to the pool defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    /// Merged over the browser-like default header set
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Retries after the first attempt
    pub retries: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub active: usize,
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_response_time_ms: f64,
}

/// RAII guard that automatically decrements a gauge on drop
struct GaugeGuard<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> GaugeGuard<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded-concurrency HTTP client over one shared keep-alive transport.
pub struct ConnectionPool {
    client: reqwest::Client,
    config: ConnectionPoolConfig,
    permits: Arc<Semaphore>,
    closed: AtomicBool,

    // Metrics
    active: AtomicUsize,
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    /// (samples, cumulative moving average in ms)
    response_time: Mutex<(u64, f64)>,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig, user_agent: &str) -> ScrapeResult<Self> {
        let mut builder = reqwest::Client::builder()
            .default_headers(default_headers(user_agent)?)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .timeout(config.request_timeout);
        if config.keep_alive {
            builder = builder.tcp_keepalive(Duration::from_secs(60));
        }
        let client = builder
            .build()
            .map_err(|e| ScrapeError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(
            "Connection pool ready: {} concurrent requests, {} idle sockets per host",
            config.max_concurrent, config.max_idle_per_host
        );

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            response_time: Mutex::new((0, 0.0)),
        })
    }

    /// Fetch `request.url` and return the body, retrying non-2xx answers and
    /// transport errors with exponential backoff.
    pub async fn fetch(&self, request: FetchRequest) -> ScrapeResult<String> {
        let cancel = request.cancel.clone().unwrap_or_else(CancellationToken::new);
        let _permit = self.admit(&cancel).await?;
        let _active = GaugeGuard::new(&self.active);

        let retries = request.retries.unwrap_or(self.config.default_retries);
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(aborted(&request.url)),
                result = self.send_once(&request) => result,
            };
            self.record(started.elapsed(), result.is_ok());

            match result {
                Ok(body) => return Ok(body),
                Err(e) if attempt < retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        url = %request.url,
                        "Request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        retries + 1,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(aborted(&request.url)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `fetch` and decode the body as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(&self, request: FetchRequest) -> ScrapeResult<T> {
        let request = request.header("Accept", "application/json");
        let url = request.url.clone();
        let body = self.fetch(request).await?;
        serde_json::from_str(&body)
            .map_err(|e| ScrapeError::Parse(format!("invalid JSON from {}: {}", url, e)))
    }

    /// Wait for a concurrency slot in FIFO order.
    async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> ScrapeResult<tokio::sync::SemaphorePermit<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScrapeError::cancelled("connection pool is shut down"));
        }

        let waiting = self.waiting.load(Ordering::SeqCst);
        if self.permits.available_permits() == 0 && waiting >= self.config.max_pending {
            warn!("Connection pool admission queue full ({} waiting)", waiting);
            return Err(ScrapeError::QueueOverflow(waiting));
        }

        let _waiting = GaugeGuard::new(&self.waiting);
        tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::cancelled("request cancelled while queued")),
            permit = self.permits.acquire() => {
                permit.map_err(|_| ScrapeError::cancelled("connection pool is shut down"))
            }
        }
    }

    async fn send_once(&self, request: &FetchRequest) -> ScrapeResult<String> {
        let timeout = request.timeout.unwrap_or(self.config.request_timeout);
        let mut builder = self.client.get(&request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::UpstreamStatus {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Fetched");
        Ok(body)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.config.retry_max_delay)
    }

    fn record(&self, elapsed: Duration, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut average = self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (samples, mean) = *average;
        let samples = samples + 1;
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        *average = (samples, mean + (sample_ms - mean) / samples as f64);
    }

    pub fn stats(&self) -> ConnectionStats {
        let (_, avg) = *self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ConnectionStats {
            active: self.active.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_response_time_ms: avg,
        }
    }

    /// Zero the lifetime counters. Gauges for in-flight work are untouched.
    pub fn reset_stats(&self) {
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        *self
            .response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (0, 0.0);
    }

    /// Stop admitting requests and wait up to `drain_timeout` for in-flight
    /// ones. Returns the number still running when the wait ended.
    pub async fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let remaining = self.active.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Connection pool drain timed out with {} request(s) still running",
                    remaining
                );
                break;
            }
            info!("Waiting for {} request(s) to complete...", remaining);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // Wake queued callers with an error
        self.permits.close();
        let remaining = self.active.load(Ordering::SeqCst);
        info!("Connection pool shut down");
        remaining
    }
}

fn default_headers(user_agent: &str) -> ScrapeResult<HeaderMap> {
    let pairs = [
        ("user-agent", user_agent),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
        ("accept-language", "en-US,en;q=0.9"),
        ("cache-control", "no-cache"),
        ("pragma", "no-cache"),
        ("upgrade-insecure-requests", "1"),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ScrapeError::Config(format!("invalid {} header: {}", name, e)))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

fn aborted(url: &str) -> ScrapeError {
    ScrapeError::cancelled(format!("request to {} aborted", url))
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ScrapeError {
    if e.is_timeout() {
        ScrapeError::Timeout(timeout)
    } else {
        ScrapeError::Network(e.to_string())
    }
}
