//! Observability contract.
//!
//! The engine reports three kinds of side effects through [`Metrics`]:
//! - latency of cache writes, checkouts and commits, labelled by model type
//! - subscriber callback failures, labelled by model type
//! - the number of concurrently open sessions
//!
//! None of these affect the functional behavior of the engine.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Model cache write latency.
pub const CACHE_LATENCY: &str = "myosin_cache_latency";
/// Model checkout latency.
pub const CHECKOUT_LATENCY: &str = "myosin_checkout_latency";
/// Model commit latency.
pub const COMMIT_LATENCY: &str = "myosin_commit_latency";
/// Subscription callback failure counter.
pub const CALLBACK_EXCEPTIONS: &str = "myosin_cb_exc_count";
/// Number of sessions currently holding locks.
pub const ACTIVE_CONTEXTS: &str = "myosin_active_contexts";

/// Sink for engine metrics.
pub trait Metrics: Send + Sync {
    /// Record how long an operation on `model` took.
    fn record_duration(&self, metric: &'static str, model: &str, elapsed: Duration);

    /// Increment a counter labelled by `model`.
    fn increment_counter(&self, metric: &'static str, model: &str);

    /// Move a gauge up or down by `delta`.
    fn add_gauge(&self, metric: &'static str, delta: i64);
}

/// Run `f` and record its duration, regardless of its outcome.
pub fn timed<R>(metrics: &dyn Metrics, metric: &'static str, model: &str, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    metrics.record_duration(metric, model, start.elapsed());
    result
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_duration(&self, _metric: &'static str, _model: &str, _elapsed: Duration) {}

    fn increment_counter(&self, _metric: &'static str, _model: &str) {}

    fn add_gauge(&self, _metric: &'static str, _delta: i64) {}
}

/// Emits every metric as a trace-level `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record_duration(&self, metric: &'static str, model: &str, elapsed: Duration) {
        tracing::trace!(metric, model, elapsed_us = elapsed.as_micros() as u64, "duration");
    }

    fn increment_counter(&self, metric: &'static str, model: &str) {
        tracing::trace!(metric, model, "counter +1");
    }

    fn add_gauge(&self, metric: &'static str, delta: i64) {
        tracing::trace!(metric, delta, "gauge");
    }
}

/// Aggregated latency for one (metric, model) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationStats {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

#[derive(Debug, Default)]
struct Collected {
    durations: HashMap<(&'static str, String), DurationStats>,
    counters: HashMap<(&'static str, String), u64>,
    gauges: HashMap<&'static str, i64>,
}

/// In-memory metrics collector.
///
/// Useful in tests and for processes that expose their own statistics.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Collected>,
}

/// Point-in-time copy of a [`MetricsCollector`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    durations: HashMap<(&'static str, String), DurationStats>,
    counters: HashMap<(&'static str, String), u64>,
    gauges: HashMap<&'static str, i64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            durations: inner.durations.clone(),
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }
}

impl Metrics for MetricsCollector {
    fn record_duration(&self, metric: &'static str, model: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = inner
            .durations
            .entry((metric, model.to_string()))
            .or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }

    fn increment_counter(&self, metric: &'static str, model: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.counters.entry((metric, model.to_string())).or_insert(0) += 1;
    }

    fn add_gauge(&self, metric: &'static str, delta: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.gauges.entry(metric).or_insert(0) += delta;
    }
}

impl MetricsSnapshot {
    pub fn counter(&self, metric: &'static str, model: &str) -> u64 {
        self.counters
            .get(&(metric, model.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, metric: &'static str) -> i64 {
        self.gauges.get(metric).copied().unwrap_or(0)
    }

    pub fn duration(&self, metric: &'static str, model: &str) -> DurationStats {
        self.durations
            .get(&(metric, model.to_string()))
            .copied()
            .unwrap_or_default()
    }
}
