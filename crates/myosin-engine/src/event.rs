//! Subscription descriptors.
//!
//! An [`Event`] binds an async callback to one model type together with the
//! transition that triggers it ([`Trigger`]) and how often it may fire
//! ([`ReconPolicy`]).

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use myosin_core::{Document, StateModel};

/// Error type returned by failing callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one callback invocation.
pub type CallbackResult = Result<(), CallbackError>;

/// Type-erased async subscriber callback.
///
/// Receives the new authoritative model and the delta that triggered it.
pub type Callback<T> =
    Arc<dyn Fn(Arc<T>, Arc<Document>) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

/// Box an async closure into a [`Callback`].
pub fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    T: StateModel,
    F: Fn(Arc<T>, Arc<Document>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    Arc::new(move |model, delta| Box::pin(f(model, delta)))
}

/// Which snapshot transition fires an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// A new desired value differs from the reported value.
    Desired,
    /// The reported value changed.
    Reported,
}

/// How often an event fires on qualifying transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconPolicy {
    /// Registered but inert; only runs when fired manually.
    Never,
    /// Fires on the first qualifying transition, then never again.
    Once,
    /// Fires on every qualifying transition.
    Always,
}

/// Unique id of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscriber registered on one model type.
///
/// The descriptor is immutable once built; only its execution counter and
/// the one-shot latch of a [`ReconPolicy::Once`] event change.
pub struct Event<T: StateModel> {
    id: SubscriptionId,
    name: String,
    trigger: Trigger,
    policy: ReconPolicy,
    callback: Callback<T>,
    executions: AtomicU64,
    armed: AtomicBool,
}

impl<T: StateModel> Event<T> {
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        policy: ReconPolicy,
        callback: Callback<T>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            name: name.into(),
            trigger,
            policy,
            callback,
            executions: AtomicU64::new(0),
            armed: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn policy(&self) -> ReconPolicy {
        self.policy
    }

    /// Number of completed invocations, successful or not.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }

    /// Whether a `Once` event has already been claimed.
    pub fn is_spent(&self) -> bool {
        self.policy == ReconPolicy::Once && !self.armed.load(Ordering::Acquire)
    }

    /// Decide whether this event fires for a transition on `trigger`.
    ///
    /// A `Once` event is claimed atomically, so only one caller ever wins it.
    pub(crate) fn claim(&self, trigger: Trigger) -> bool {
        if self.trigger != trigger {
            return false;
        }
        match self.policy {
            ReconPolicy::Never => false,
            ReconPolicy::Always => true,
            ReconPolicy::Once => self.armed.swap(false, Ordering::AcqRel),
        }
    }

    pub(crate) fn invoke(&self, model: Arc<T>, delta: Arc<Document>) -> BoxFuture<'static, CallbackResult> {
        (self.callback)(model, delta)
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: StateModel> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("policy", &self.policy)
            .field("executions", &self.executions())
            .finish()
    }
}
