use axum::extract::State;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ad_radar_cache::CacheStats;
use ad_radar_common::{PerformanceStats, PoolStats, QueueStats};

use crate::connection_pool::ConnectionStats;
use crate::service::ScraperService;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    instance: String,
    pub browsers_total: IntGaugeVec,
    pub browsers_in_use: IntGaugeVec,
    pub jobs_queued: IntGaugeVec,
    pub jobs_active: IntGaugeVec,
    pub http_active: IntGaugeVec,
    pub http_waiting: IntGaugeVec,
    pub cache_keys: IntGaugeVec,
    pub cache_hit_ratio: GaugeVec,
    pub avg_response_time_ms: GaugeVec,
    pub requests_total: IntGaugeVec,
    pub requests_failed: IntGaugeVec,
}

/// Everything `/stats` reports in one document
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub performance: PerformanceStats,
    pub browser_pool: PoolStats,
    pub queue: QueueStats,
    pub connections: ConnectionStats,
    pub cache: CacheStats,
}

impl TelemetrySnapshot {
    pub async fn collect(service: &ScraperService) -> Self {
        Self {
            performance: service.get_performance_stats(),
            browser_pool: service.get_pool_stats().await,
            queue: service.queue_stats(),
            connections: service.connection_stats(),
            cache: service.cache_stats(),
        }
    }
}

#[derive(Clone)]
struct TelemetryState {
    metrics: Metrics,
    service: Arc<ScraperService>,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntGaugeVec> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["instance"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn float_gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), &["instance"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new(instance: &str) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let metrics = Self {
            browsers_total: int_gauge(
                &registry,
                "ad_radar_browsers_total",
                "Browser instances currently in the pool",
            )?,
            browsers_in_use: int_gauge(
                &registry,
                "ad_radar_browsers_in_use",
                "Browser instances leased to a job",
            )?,
            jobs_queued: int_gauge(
                &registry,
                "ad_radar_jobs_queued",
                "Jobs waiting for a queue slot",
            )?,
            jobs_active: int_gauge(&registry, "ad_radar_jobs_active", "Jobs executing")?,
            http_active: int_gauge(
                &registry,
                "ad_radar_http_active",
                "Outbound HTTP requests in flight",
            )?,
            http_waiting: int_gauge(
                &registry,
                "ad_radar_http_waiting",
                "Outbound HTTP requests waiting for admission",
            )?,
            cache_keys: int_gauge(
                &registry,
                "ad_radar_cache_keys",
                "Entries in the local cache tier",
            )?,
            cache_hit_ratio: float_gauge(
                &registry,
                "ad_radar_cache_hit_ratio",
                "Cache hits over lookups since the last reset",
            )?,
            avg_response_time_ms: float_gauge(
                &registry,
                "ad_radar_avg_response_time_ms",
                "Moving average of request execution time",
            )?,
            requests_total: int_gauge(
                &registry,
                "ad_radar_requests_total",
                "Stats and search requests handled",
            )?,
            requests_failed: int_gauge(
                &registry,
                "ad_radar_requests_failed",
                "Requests that failed for a reason other than cancellation",
            )?,
            registry,
            instance: instance.to_string(),
        };
        metrics.observe(&TelemetrySnapshot {
            performance: PerformanceStats::default(),
            browser_pool: PoolStats::default(),
            queue: QueueStats::default(),
            connections: ConnectionStats::default(),
            cache: CacheStats::default(),
        });

        Ok(metrics)
    }

    /// Copy a snapshot into the gauges.
    pub fn observe(&self, snapshot: &TelemetrySnapshot) {
        let labels = [self.instance.as_str()];
        let set = |gauge: &IntGaugeVec, value: usize| {
            gauge
                .with_label_values(&labels)
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        };

        set(&self.browsers_total, snapshot.browser_pool.total);
        set(&self.browsers_in_use, snapshot.browser_pool.in_use);
        set(&self.jobs_queued, snapshot.queue.queued);
        set(&self.jobs_active, snapshot.queue.active);
        set(&self.http_active, snapshot.connections.active);
        set(&self.http_waiting, snapshot.connections.waiting);
        set(&self.cache_keys, snapshot.cache.keys);
        set(
            &self.requests_total,
            usize::try_from(snapshot.performance.total_requests).unwrap_or(usize::MAX),
        );
        set(
            &self.requests_failed,
            usize::try_from(snapshot.performance.errors).unwrap_or(usize::MAX),
        );
        self.cache_hit_ratio
            .with_label_values(&labels)
            .set(snapshot.cache.hit_rate);
        self.avg_response_time_ms
            .with_label_values(&labels)
            .set(snapshot.performance.avg_response_time);
    }

    /// Start the telemetry HTTP server on `port`. Returns once `shutdown`
    /// is cancelled.
    pub async fn start_server(
        self,
        port: u16,
        service: Arc<ScraperService>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("Telemetry server listening on {}", addr);

        self.serve(listener, service, shutdown).await
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        service: Arc<ScraperService>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .with_state(TelemetryState {
                metrics: self,
                service,
            });

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Telemetry server stopped");
        Ok(())
    }
}

async fn metrics_handler(State(state): State<TelemetryState>) -> impl IntoResponse {
    state
        .metrics
        .observe(&TelemetrySnapshot::collect(&state.service).await);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

async fn stats_handler(State(state): State<TelemetryState>) -> Json<TelemetrySnapshot> {
    Json(TelemetrySnapshot::collect(&state.service).await)
}

async fn health_handler(State(state): State<TelemetryState>) -> impl IntoResponse {
    let pool = state.service.get_pool_stats().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "browsers": pool.total,
            "queued": state.service.queue_stats().queued,
        })),
    )
}
