use ad_radar_common::AppConfig;
use ad_radar_worker::run_worker;
use anyhow::Result;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level, e.g. RUST_LOG=ad_radar_worker=debug
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration comes from AD_RADAR_* environment variables
    let config = AppConfig::from_env();

    run_worker(config).await
}
