//! # myosin-core
//!
//! Core state model contract and persistence for the myosin state engine.
//!
//! This crate provides:
//! - The [`StateModel`] contract and stable [`TypeTag`] identities
//! - Recursive delta computation between serialized snapshots
//! - The file-backed [`ModelCache`] persistence adapter
//! - Engine configuration, error taxonomy and the metrics contract
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Subscription dispatch lives in `myosin-engine`.

pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod metrics;
pub mod model;

pub use cache::{LoadOutcome, ModelCache};
pub use config::EngineConfig;
pub use delta::filter_delta;
pub use error::{CacheError, ModelError, StateError};
pub use metrics::{Metrics, MetricsCollector, NoopMetrics, TracingMetrics};
pub use model::*;
