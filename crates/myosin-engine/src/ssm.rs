//! State subscription model.
//!
//! One [`Ssm`] wraps each registered model type. It owns:
//! - the reported snapshot (last value committed by whoever observes reality)
//! - the desired snapshot (externally requested target)
//! - the type's session lock
//! - the ordered list of subscribed events
//!
//! Committing into either slot computes a delta and selects the events that
//! qualify for the transition; the engine hands them to the dispatcher.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use myosin_core::{filter_delta, Document, ModelError, StateModel, TypeTag};

use crate::event::{Event, SubscriptionId, Trigger};
use crate::session::SessionLock;

/// Type-erased view of a wrapper, as stored in the registry.
pub(crate) trait Registered: Send + Sync {
    fn type_tag(&self) -> TypeTag;

    fn session_lock(&self) -> Arc<SessionLock>;

    fn subscription_count(&self) -> usize;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Snapshots<T> {
    reported: Arc<T>,
    desired: Arc<T>,
}

/// Result of installing a new snapshot.
pub(crate) struct Resolution<T: StateModel> {
    pub(crate) trigger: Trigger,
    pub(crate) model: Arc<T>,
    pub(crate) delta: Document,
    pub(crate) events: Vec<Arc<Event<T>>>,
}

/// Subscription wrapper for one model type.
pub struct Ssm<T: StateModel> {
    session_lock: Arc<SessionLock>,
    snapshots: Mutex<Snapshots<T>>,
    events: RwLock<Vec<Arc<Event<T>>>>,
}

impl<T: StateModel> Ssm<T> {
    /// Wrap `reference` as both the initial reported and desired value.
    ///
    /// The two slots get independent copies.
    pub fn new(reference: T) -> Self {
        Self {
            session_lock: Arc::new(SessionLock::new(())),
            snapshots: Mutex::new(Snapshots {
                desired: Arc::new(reference.clone()),
                reported: Arc::new(reference),
            }),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Current reported snapshot.
    pub fn reported(&self) -> Arc<T> {
        Arc::clone(&self.lock_snapshots().reported)
    }

    /// Current desired snapshot.
    pub fn desired(&self) -> Arc<T> {
        Arc::clone(&self.lock_snapshots().desired)
    }

    /// Desired changes not yet reflected in the reported value.
    pub fn delta(&self) -> Result<Document, ModelError> {
        let snapshots = self.lock_snapshots();
        Ok(filter_delta(
            &snapshots.reported.dump()?,
            &snapshots.desired.dump()?,
        ))
    }

    /// Install a new desired value.
    ///
    /// Events fire only if the desired value differs from the reported one.
    pub(crate) fn resolve_desired(&self, model: T) -> Result<Resolution<T>, ModelError> {
        let incoming = model.dump()?;
        let model = Arc::new(model);

        let mut snapshots = self.lock_snapshots();
        let reported = snapshots.reported.dump()?;
        snapshots.desired = Arc::clone(&model);

        let delta = filter_delta(&reported, &incoming);
        let events = if delta.is_empty() {
            debug!("Reconciled desired changes for state model: {}", T::TYPE_TAG);
            Vec::new()
        } else {
            self.select(Trigger::Desired)
        };

        Ok(Resolution {
            trigger: Trigger::Desired,
            model,
            delta,
            events,
        })
    }

    /// Install a new reported value.
    ///
    /// Events fire only if the reported value changed.
    pub(crate) fn resolve_reported(&self, model: T) -> Result<Resolution<T>, ModelError> {
        let incoming = model.dump()?;
        let model = Arc::new(model);

        let mut snapshots = self.lock_snapshots();
        let previous = snapshots.reported.dump()?;
        snapshots.reported = Arc::clone(&model);

        let delta = filter_delta(&previous, &incoming);
        let events = if delta.is_empty() {
            debug!("No reported changes for state model: {}", T::TYPE_TAG);
            Vec::new()
        } else {
            self.select(Trigger::Reported)
        };

        Ok(Resolution {
            trigger: Trigger::Reported,
            model,
            delta,
            events,
        })
    }

    /// Append an event; returns its id.
    pub fn subscribe(&self, event: Event<T>) -> SubscriptionId {
        let id = event.id();
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(event));
        id
    }

    /// Remove an event; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let before = events.len();
        events.retain(|event| event.id() != id);
        events.len() != before
    }

    pub fn event(&self, id: SubscriptionId) -> Option<Arc<Event<T>>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|event| event.id() == id)
            .cloned()
    }

    /// Registered events, in subscription order.
    pub fn events(&self) -> Vec<Arc<Event<T>>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn select(&self, trigger: Trigger) -> Vec<Arc<Event<T>>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.claim(trigger))
            .cloned()
            .collect()
    }

    fn lock_snapshots(&self) -> std::sync::MutexGuard<'_, Snapshots<T>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: StateModel> Registered for Ssm<T> {
    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn session_lock(&self) -> Arc<SessionLock> {
        Arc::clone(&self.session_lock)
    }

    fn subscription_count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: StateModel> std::fmt::Display for Ssm<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", T::TYPE_TAG)
    }
}
