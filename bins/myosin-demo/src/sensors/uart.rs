//! Simulated UART temperature sensor.

use std::sync::Arc;
use std::time::Duration;

use myosin_engine::{CommitOptions, StateEngine, TypeTag};

use crate::models::Telemetry;

const MIN_READING: f64 = 10.5;
const MAX_READING: f64 = 75.5;

/// Reading for sample `step`, swinging between the sensor's limits.
pub fn sample(step: u64) -> f64 {
    let mid = (MIN_READING + MAX_READING) / 2.0;
    let amplitude = (MAX_READING - MIN_READING) / 2.0;
    mid + amplitude * (step as f64 * 0.7).sin()
}

/// Commit a new reading every `period`, persisting each one.
pub async fn report_loop(engine: Arc<StateEngine>, period: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    let mut step = 0u64;
    loop {
        ticker.tick().await;
        step += 1;

        let telemetry = {
            let session = engine.open_async(&[TypeTag::of::<Telemetry>()]).await?;
            let mut telemetry: Telemetry = session.checkout()?;
            telemetry.tp = sample(step);
            session.commit(&telemetry, CommitOptions::reported().cached())?;
            telemetry
        };
        tracing::info!("Telemetry report: {}", telemetry);
    }
}
