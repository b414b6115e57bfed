//! # myosin-engine
//!
//! In-process state engine built on `myosin-core`.
//!
//! - [`StateEngine`] registers one authoritative instance per model type
//! - [`Session`] brackets read-modify-write sequences with per-type locks
//! - commits compute a delta and dispatch subscribed callbacks onto a tokio
//!   runtime, isolating their failures from the committer

pub mod dispatch;
pub mod event;
pub mod session;
pub mod ssm;
pub mod state;

pub use dispatch::{CallbackFailure, DispatchHandle, DispatchReport, Dispatcher};
pub use event::{callback, Callback, CallbackError, CallbackResult, Event, ReconPolicy, SubscriptionId, Trigger};
pub use session::Session;
pub use ssm::Ssm;
pub use state::{CommitOptions, StateEngine};

pub use myosin_core::{
    Document, EngineConfig, LoadOutcome, Metrics, MetricsCollector, ModelError, ModelId,
    NoopMetrics, StateError, StateModel, TracingMetrics, TypeTag, from_document, to_document,
};
