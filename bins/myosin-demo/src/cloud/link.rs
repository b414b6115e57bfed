//! Simulated cloud link.
//!
//! Publishes telemetry while the device is online and periodically requests a
//! connectivity change through the desired `System` snapshot. A subscriber
//! applies the request and reports the new state back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{info, warn};

use myosin_engine::{
    CallbackError, CommitOptions, ReconPolicy, StateEngine, StateModel, SubscriptionId, Trigger,
    TypeTag,
};

use crate::models::{System, Telemetry};

/// Wire the link's subscribers into the engine.
///
/// Callbacks hold a weak reference so the registry never keeps the engine
/// alive.
pub fn register(engine: &Arc<StateEngine>) -> anyhow::Result<Vec<SubscriptionId>> {
    let weak: Weak<StateEngine> = Arc::downgrade(engine);
    let apply = engine.subscribe::<System, _, _>(
        "apply_connectivity",
        Trigger::Desired,
        ReconPolicy::Always,
        move |desired, delta| {
            let weak = weak.clone();
            async move {
                let engine = weak
                    .upgrade()
                    .ok_or_else(|| CallbackError::from("state engine dropped"))?;
                info!("Applying connectivity change: {:?}", delta);
                engine.commit(&*desired, CommitOptions::reported().cached())?;
                Ok(())
            }
        },
    )?;

    let announce = engine.subscribe::<System, _, _>(
        "announce_connectivity",
        Trigger::Reported,
        ReconPolicy::Always,
        |system, _delta| async move {
            if system.online {
                info!("Cloud link online");
            } else {
                warn!("Cloud link offline");
            }
            Ok(())
        },
    )?;

    let first_reading = engine.subscribe::<Telemetry, _, _>(
        "first_reading",
        Trigger::Reported,
        ReconPolicy::Once,
        |telemetry, _delta| async move {
            info!("First sensor reading received: {}", telemetry);
            Ok(())
        },
    )?;

    Ok(vec![apply, announce, first_reading])
}

/// Publish telemetry every `period`; every `toggle_every` cycles ask the
/// device to flip its connectivity.
pub async fn report_loop(
    engine: Arc<StateEngine>,
    period: Duration,
    toggle_every: u64,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    let mut cycle = 0u64;
    loop {
        ticker.tick().await;
        cycle += 1;

        let (telemetry, system) = {
            let session = engine
                .open_async(&[TypeTag::of::<Telemetry>(), TypeTag::of::<System>()])
                .await?;
            let telemetry: Telemetry = session.checkout()?;
            let system: System = session.checkout()?;
            (telemetry, system)
        };

        if system.online {
            let payload = serde_json::to_string(&telemetry.dump()?)?;
            info!("Publishing telemetry: {}", payload);
        } else {
            warn!("Link offline, dropping telemetry report");
        }

        if toggle_every > 0 && cycle % toggle_every == 0 {
            let request = System {
                online: !system.online,
                ..system
            };
            info!("Requesting online={}", request.online);
            engine.commit(&request, CommitOptions::desired())?;
        }
    }
}
