//! State models shared by the demo's producer and cloud link.

mod system;
mod telemetry;

pub use system::System;
pub use telemetry::Telemetry;
