mod cloud;
mod models;
mod sensors;

use std::sync::Arc;
use std::time::Duration;

use myosin_engine::{EngineConfig, StateEngine, TracingMetrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::{System, Telemetry};

const DEFAULT_CACHE_DIR: &str = "demo-cache";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,myosin_engine=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("myosin demo starting...");

    // Configuration
    let mut config = EngineConfig::from_env();
    if config.cache_base_path.is_none() {
        config = config.with_cache_base_path(DEFAULT_CACHE_DIR);
    }
    if let Some(path) = &config.cache_base_path {
        std::fs::create_dir_all(path)?;
    }

    let engine = Arc::new(StateEngine::with_metrics(config, Arc::new(TracingMetrics))?);
    {
        let session = engine.open_async(&[]).await?;
        let telemetry = session.load(Telemetry::new())?;
        let system = session.load(System::default())?;
        tracing::info!("Restored {} with online={}", telemetry, system.online);
    }

    let subscriptions = cloud::link::register(&engine)?;
    tracing::info!("Registered {} subscriber(s)", subscriptions.len());

    let mut sensor_handle = tokio::spawn(sensors::uart::report_loop(
        Arc::clone(&engine),
        Duration::from_secs(1),
    ));
    let mut cloud_handle = tokio::spawn(cloud::link::report_loop(
        Arc::clone(&engine),
        Duration::from_secs(2),
        5,
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = &mut sensor_handle => {
            tracing::warn!("Sensor loop stopped: {:?}", result);
        }
        result = &mut cloud_handle => {
            tracing::warn!("Cloud link stopped: {:?}", result);
        }
    }

    sensor_handle.abort();
    cloud_handle.abort();
    let _ = sensor_handle.await;
    let _ = cloud_handle.await;

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown(),
        Err(_) => tracing::warn!("State engine still shared at exit"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
