//! The state engine: registry of live models, sessions and commits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use myosin_core::delta::{changed_paths, leaf_count};
use myosin_core::metrics::{timed, CACHE_LATENCY, CHECKOUT_LATENCY, COMMIT_LATENCY};
use myosin_core::{
    Document, EngineConfig, LoadOutcome, Metrics, ModelCache, ModelError, StateError, StateModel,
    TracingMetrics, TypeTag,
};

use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::event::{callback, CallbackResult, Event, ReconPolicy, SubscriptionId, Trigger};
use crate::session::{PendingLock, Session};
use crate::ssm::{Registered, Ssm};

/// How a commit is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Persist the committed model after the commit.
    pub cache: bool,
    /// Write into the desired slot instead of the reported one.
    pub desired: bool,
}

impl CommitOptions {
    pub fn reported() -> Self {
        Self::default()
    }

    pub fn desired() -> Self {
        Self {
            desired: true,
            ..Self::default()
        }
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }
}

/// Thread-safe registry of state models.
///
/// Each registered type has one authoritative instance, wrapped in an
/// [`Ssm`] that tracks its reported and desired snapshots and the events
/// subscribed to it. Share the engine via `Arc<StateEngine>`.
pub struct StateEngine {
    config: EngineConfig,
    registry: RwLock<HashMap<TypeTag, Arc<dyn Registered>>>,
    cache: ModelCache,
    dispatcher: Dispatcher,
    metrics: Arc<dyn Metrics>,
}

impl StateEngine {
    /// Engine reporting metrics as trace-level `tracing` events.
    pub fn new(config: EngineConfig) -> Result<Self, StateError> {
        Self::with_metrics(config, Arc::new(TracingMetrics))
    }

    pub fn with_metrics(config: EngineConfig, metrics: Arc<dyn Metrics>) -> Result<Self, StateError> {
        let dispatcher = Dispatcher::new(&config)?;
        let cache = ModelCache::from_config(&config);
        match cache.base_path() {
            Some(path) => info!("State engine caching to {}", path.display()),
            None => info!("State engine running uncached"),
        }

        Ok(Self {
            config,
            registry: RwLock::new(HashMap::new()),
            cache,
            dispatcher,
            metrics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }

    /// Open a session holding the locks of `types`.
    ///
    /// Fails with [`StateError::ModelNotFound`] before acquiring anything if
    /// one of the types is not registered. Blocks the current thread until
    /// every lock is free; prefer [`open_async`](Self::open_async) in async code.
    pub fn open(&self, types: &[TypeTag]) -> Result<Session<'_>, StateError> {
        let locks = self.session_locks(types)?;
        Session::acquire(self, locks)
    }

    /// Open a session, awaiting each lock instead of blocking.
    pub async fn open_async(&self, types: &[TypeTag]) -> Result<Session<'_>, StateError> {
        let locks = self.session_locks(types)?;
        Ok(Session::acquire_async(self, locks).await)
    }

    /// Register `model` as the authoritative instance of its type.
    ///
    /// The model is first hydrated from its cached document, if any. Loading
    /// a type again replaces its wrapper, dropping existing subscriptions.
    pub fn load<T: StateModel>(&self, mut model: T) -> Result<T, StateError> {
        let tag = TypeTag::of::<T>();
        debug!("Loading state model: {}", tag);

        let outcome = timed(self.metrics(), CACHE_LATENCY, tag.as_str(), || {
            self.cache.load(&mut model)
        });

        if let Err(source) = model.dump() {
            error!("Failed to load {}: model is not serializable: {}", tag, source);
            return Err(uninitialized(tag, source));
        }

        let wrapper: Arc<dyn Registered> = Arc::new(Ssm::new(model.clone()));
        let replaced = self.registry_write().insert(tag, wrapper).is_some();
        if replaced {
            warn!("Reloaded state model {}, previous subscriptions dropped", tag);
        }

        match outcome {
            LoadOutcome::Hydrated => info!("Loaded state model {} from cache", tag),
            LoadOutcome::Missing | LoadOutcome::Corrupt => {
                info!("Loaded state model {} with defaults", tag)
            }
        }
        Ok(model)
    }

    /// Copy of the reported snapshot.
    pub fn checkout<T: StateModel>(&self) -> Result<T, StateError> {
        timed(self.metrics(), CHECKOUT_LATENCY, T::TYPE_TAG, || {
            let wrapper = self.wrapper::<T>()?;
            let reported = wrapper.reported();
            Ok(T::clone(&reported))
        })
    }

    /// Copy of the desired snapshot.
    pub fn checkout_desired<T: StateModel>(&self) -> Result<T, StateError> {
        timed(self.metrics(), CHECKOUT_LATENCY, T::TYPE_TAG, || {
            let wrapper = self.wrapper::<T>()?;
            let desired = wrapper.desired();
            Ok(T::clone(&desired))
        })
    }

    /// Publish a copy of `model` and schedule the subscribers it qualifies.
    ///
    /// With `cache` set, the committed model is persisted afterwards, into
    /// whichever slot it was written. A persistence failure is returned, but
    /// the in-memory update stands and the dispatch round has already been
    /// scheduled.
    pub fn commit<T: StateModel>(
        &self,
        model: &T,
        options: CommitOptions,
    ) -> Result<DispatchHandle, StateError> {
        let tag = TypeTag::of::<T>();
        timed(self.metrics(), COMMIT_LATENCY, tag.as_str(), || {
            let wrapper = self.wrapper::<T>().map_err(|e| {
                error!("Failed to commit state model {}: {}", tag, e);
                e
            })?;

            let copy = model.clone();
            let resolved = if options.desired {
                wrapper.resolve_desired(copy)
            } else {
                wrapper.resolve_reported(copy)
            };
            let resolution = resolved.map_err(|source| uninitialized(tag, source))?;

            info!(
                "Committed {:?} state model {} ({} changed field(s))",
                resolution.trigger,
                tag,
                leaf_count(&resolution.delta)
            );
            if !resolution.delta.is_empty() {
                debug!("{} delta: {:?}", tag, changed_paths(&resolution.delta));
            }

            let committed = Arc::clone(&resolution.model);
            let handle = self.dispatcher.dispatch(
                resolution.trigger,
                resolution.events,
                resolution.model,
                Arc::new(resolution.delta),
                Arc::clone(&self.metrics),
            )?;

            if options.cache {
                timed(self.metrics(), CACHE_LATENCY, tag.as_str(), || {
                    self.cache.cache(&*committed)
                })?;
            }

            Ok(handle)
        })
    }

    /// Subscribe an async callback to transitions of `T`.
    pub fn subscribe<T, F, Fut>(
        &self,
        name: impl Into<String>,
        trigger: Trigger,
        policy: ReconPolicy,
        f: F,
    ) -> Result<SubscriptionId, StateError>
    where
        T: StateModel,
        F: Fn(Arc<T>, Arc<Document>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let wrapper = self.wrapper::<T>()?;
        let event = Event::new(name, trigger, policy, callback(f));
        debug!(
            "Subscribing {} to {:?} changes of {} ({:?})",
            event.name(),
            trigger,
            T::TYPE_TAG,
            policy
        );
        Ok(wrapper.subscribe(event))
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe<T: StateModel>(&self, id: SubscriptionId) -> Result<bool, StateError> {
        let removed = self.wrapper::<T>()?.unsubscribe(id);
        if removed {
            debug!("Unsubscribed {} from {}", id, T::TYPE_TAG);
        }
        Ok(removed)
    }

    /// Run one subscription now, whatever its policy.
    ///
    /// The callback receives the snapshot of its trigger and the pending
    /// desired delta.
    pub fn fire<T: StateModel>(&self, id: SubscriptionId) -> Result<DispatchHandle, StateError> {
        let tag = TypeTag::of::<T>();
        let wrapper = self.wrapper::<T>()?;
        let event = wrapper
            .event(id)
            .ok_or_else(|| StateError::SubscriptionNotFound {
                type_tag: tag.to_string(),
                id: id.to_string(),
            })?;

        let delta = wrapper.delta().map_err(|source| uninitialized(tag, source))?;
        let model = match event.trigger() {
            Trigger::Desired => wrapper.desired(),
            Trigger::Reported => wrapper.reported(),
        };

        info!("Manually firing {} on {}", event.name(), tag);
        self.dispatcher.dispatch(
            event.trigger(),
            vec![event],
            model,
            Arc::new(delta),
            Arc::clone(&self.metrics),
        )
    }

    /// Completed invocations of a subscription, successful or not.
    pub fn executions<T: StateModel>(&self, id: SubscriptionId) -> Result<u64, StateError> {
        self.wrapper::<T>()?
            .event(id)
            .map(|event| event.executions())
            .ok_or_else(|| StateError::SubscriptionNotFound {
                type_tag: T::TYPE_TAG.to_string(),
                id: id.to_string(),
            })
    }

    /// Desired changes not yet reflected in the reported snapshot.
    pub fn pending_delta<T: StateModel>(&self) -> Result<Document, StateError> {
        self.wrapper::<T>()?
            .delta()
            .map_err(|source| uninitialized(TypeTag::of::<T>(), source))
    }

    /// Number of subscriptions on a registered type.
    pub fn subscriptions(&self, tag: TypeTag) -> Result<usize, StateError> {
        self.registry_read()
            .get(&tag)
            .map(|entry| entry.subscription_count())
            .ok_or_else(|| StateError::model_not_found(tag.as_str()))
    }

    /// Registered types, sorted.
    pub fn registered(&self) -> Vec<TypeTag> {
        let mut tags: Vec<TypeTag> = self.registry_read().keys().copied().collect();
        tags.sort();
        tags
    }

    pub fn is_registered(&self, tag: TypeTag) -> bool {
        self.registry_read().contains_key(&tag)
    }

    /// Unregister every type and delete its cached document.
    pub fn reset(&self) {
        let drained: Vec<Arc<dyn Registered>> = self
            .registry_write()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &drained {
            let tag = entry.type_tag();
            if let Err(e) = self.cache.clear(tag) {
                warn!("Failed to clear cached document for {}: {}", tag, e);
            }
        }
        info!("State registry reset, {} model(s) removed", drained.len());
    }

    /// Tear the engine down, stopping an owned dispatch runtime.
    pub fn shutdown(self) {
        self.dispatcher.shutdown();
        info!("State engine shut down");
    }

    /// Session locks of `types`, sorted and deduplicated.
    fn session_locks(&self, types: &[TypeTag]) -> Result<Vec<PendingLock>, StateError> {
        let mut tags = types.to_vec();
        tags.sort();
        tags.dedup();

        let registry = self.registry_read();
        tags.into_iter()
            .map(|tag| {
                registry
                    .get(&tag)
                    .map(|entry| PendingLock {
                        tag,
                        lock: entry.session_lock(),
                    })
                    .ok_or_else(|| StateError::model_not_found(tag.as_str()))
            })
            .collect()
    }

    fn wrapper<T: StateModel>(&self) -> Result<Arc<Ssm<T>>, StateError> {
        let tag = TypeTag::of::<T>();
        let entry = self
            .registry_read()
            .get(&tag)
            .cloned()
            .ok_or_else(|| StateError::model_not_found(tag.as_str()))?;

        entry
            .into_any()
            .downcast::<Ssm<T>>()
            .map_err(|_| StateError::TypeMismatch {
                type_tag: tag.to_string(),
            })
    }

    fn registry_read(&self) -> RwLockReadGuard<'_, HashMap<TypeTag, Arc<dyn Registered>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, HashMap<TypeTag, Arc<dyn Registered>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine")
            .field("registered", &self.registered())
            .field("cache_base_path", &self.cache.base_path())
            .field("owns_runtime", &self.dispatcher.owns_runtime())
            .finish()
    }
}

fn uninitialized(tag: TypeTag, source: ModelError) -> StateError {
    StateError::UninitializedState {
        type_tag: tag.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myosin_core::metrics::ACTIVE_CONTEXTS;
    use myosin_core::{from_document, to_document, MetricsCollector, ModelId};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Valve {
        id: Option<ModelId>,
        open: bool,
        flow: f64,
    }

    impl Valve {
        fn new() -> Self {
            Self {
                id: Some(ModelId::Int(7)),
                open: false,
                flow: 0.0,
            }
        }
    }

    impl StateModel for Valve {
        const TYPE_TAG: &'static str = "Valve";

        fn id(&self) -> Option<&ModelId> {
            self.id.as_ref()
        }

        fn dump(&self) -> Result<Document, ModelError> {
            to_document(self)
        }

        fn hydrate(&mut self, document: &Document) -> Result<(), ModelError> {
            *self = from_document(document)?;
            Ok(())
        }
    }

    /// Claims the same tag as `Valve` with a different layout.
    #[derive(Debug, Clone)]
    struct Impostor;

    impl StateModel for Impostor {
        const TYPE_TAG: &'static str = "Valve";

        fn id(&self) -> Option<&ModelId> {
            None
        }

        fn dump(&self) -> Result<Document, ModelError> {
            Ok(Document::new())
        }

        fn hydrate(&mut self, _document: &Document) -> Result<(), ModelError> {
            Ok(())
        }
    }

    /// Cannot be serialized until `label` is set.
    #[derive(Debug, Clone)]
    struct Unlabelled {
        label: Option<String>,
    }

    impl StateModel for Unlabelled {
        const TYPE_TAG: &'static str = "Unlabelled";

        fn id(&self) -> Option<&ModelId> {
            None
        }

        fn dump(&self) -> Result<Document, ModelError> {
            let label = self.label.as_ref().ok_or_else(|| ModelError::Uninitialized {
                field: "label".into(),
            })?;
            let mut document = Document::new();
            document.insert("label".into(), json!(label));
            Ok(document)
        }

        fn hydrate(&mut self, _document: &Document) -> Result<(), ModelError> {
            Ok(())
        }
    }

    fn engine() -> StateEngine {
        StateEngine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_checkout_is_isolated() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();

        let mut copy: Valve = engine.checkout().unwrap();
        assert_eq!(copy, Valve::new());
        copy.open = true;
        assert!(!engine.checkout::<Valve>().unwrap().open);
    }

    #[test]
    fn test_unregistered_operations_fail() {
        let engine = engine();
        assert!(matches!(
            engine.checkout::<Valve>(),
            Err(StateError::ModelNotFound { .. })
        ));
        assert!(matches!(
            engine.commit(&Valve::new(), CommitOptions::reported()),
            Err(StateError::ModelNotFound { .. })
        ));
        assert!(matches!(
            engine.subscribe::<Valve, _, _>("noop", Trigger::Reported, ReconPolicy::Always, |_m, _d| async { Ok(()) }),
            Err(StateError::ModelNotFound { .. })
        ));
        assert!(matches!(
            engine.open(&[TypeTag::of::<Valve>()]),
            Err(StateError::ModelNotFound { .. })
        ));
        assert!(engine.registered().is_empty());
    }

    #[test]
    fn test_type_mismatch() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();
        assert!(matches!(
            engine.checkout::<Impostor>(),
            Err(StateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_rejects_unserializable_model() {
        let engine = engine();
        match engine.load(Unlabelled { label: None }) {
            Err(StateError::UninitializedState { type_tag, source }) => {
                assert_eq!(type_tag, "Unlabelled");
                assert!(matches!(source, ModelError::Uninitialized { .. }));
            }
            other => panic!("Expected UninitializedState, got {:?}", other),
        }
        assert!(!engine.is_registered(TypeTag::new("Unlabelled")));

        engine
            .load(Unlabelled {
                label: Some("pump".into()),
            })
            .unwrap();
        assert!(engine.is_registered(TypeTag::new("Unlabelled")));
    }

    #[test]
    fn test_commit_updates_reported_snapshot() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();

        let mut valve: Valve = engine.checkout().unwrap();
        valve.flow = 3.5;
        let report = engine
            .commit(&valve, CommitOptions::reported())
            .unwrap()
            .wait()
            .unwrap();
        assert!(report.is_clean());

        valve.flow = 9.0;
        assert_eq!(engine.checkout::<Valve>().unwrap().flow, 3.5);
    }

    #[test]
    fn test_desired_commit_leaves_reported() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();

        let mut target = Valve::new();
        target.open = true;
        engine.commit(&target, CommitOptions::desired()).unwrap();

        assert!(!engine.checkout::<Valve>().unwrap().open);
        assert!(engine.checkout_desired::<Valve>().unwrap().open);
        let pending = engine.pending_delta::<Valve>().unwrap();
        assert_eq!(pending.get("open"), Some(&json!(true)));
        assert_eq!(pending.len(), 1);

        engine.commit(&target, CommitOptions::reported()).unwrap();
        assert!(engine.pending_delta::<Valve>().unwrap().is_empty());
    }

    #[test]
    fn test_zero_type_session() {
        let engine = engine();
        let session = engine.open(&[]).unwrap();
        assert!(session.locked_types().is_empty());
        session.load(Valve::new()).unwrap();
        drop(session);
        assert_eq!(engine.registered(), vec![TypeTag::of::<Valve>()]);
    }

    #[test]
    fn test_session_dedupes_and_sorts() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();
        engine
            .load(Unlabelled {
                label: Some("pump".into()),
            })
            .unwrap();

        let valve = TypeTag::of::<Valve>();
        let unlabelled = TypeTag::new("Unlabelled");
        let session = engine.open(&[valve, unlabelled, valve]).unwrap();
        assert_eq!(session.locked_types(), vec![unlabelled, valve]);
        assert!(session.holds(valve));
    }

    #[test]
    fn test_reload_drops_subscriptions() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();
        engine
            .subscribe::<Valve, _, _>("noop", Trigger::Reported, ReconPolicy::Always, |_m, _d| async { Ok(()) })
            .unwrap();
        assert_eq!(engine.subscriptions(TypeTag::of::<Valve>()).unwrap(), 1);

        engine.load(Valve::new()).unwrap();
        assert_eq!(engine.subscriptions(TypeTag::of::<Valve>()).unwrap(), 0);
    }

    #[test]
    fn test_unsubscribe_and_fire_unknown() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();
        let id = engine
            .subscribe::<Valve, _, _>("noop", Trigger::Reported, ReconPolicy::Always, |_m, _d| async { Ok(()) })
            .unwrap();

        assert!(engine.unsubscribe::<Valve>(id).unwrap());
        assert!(!engine.unsubscribe::<Valve>(id).unwrap());
        assert!(matches!(
            engine.fire::<Valve>(id),
            Err(StateError::SubscriptionNotFound { .. })
        ));
    }

    #[test]
    fn test_reset_unregisters() {
        let engine = engine();
        engine.load(Valve::new()).unwrap();
        engine.reset();
        assert!(engine.registered().is_empty());
        assert!(engine.checkout::<Valve>().is_err());
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(MetricsCollector::new());
        let engine = StateEngine::with_metrics(EngineConfig::default(), metrics.clone()).unwrap();
        engine.load(Valve::new()).unwrap();

        {
            let session = engine.open(&[TypeTag::of::<Valve>()]).unwrap();
            assert_eq!(metrics.snapshot().gauge(ACTIVE_CONTEXTS), 1);
            let valve: Valve = session.checkout().unwrap();
            session.commit(&valve, CommitOptions::reported()).unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gauge(ACTIVE_CONTEXTS), 0);
        assert_eq!(snapshot.duration(CHECKOUT_LATENCY, "Valve").count, 1);
        assert_eq!(snapshot.duration(COMMIT_LATENCY, "Valve").count, 1);
    }

    #[test]
    fn test_commit_options() {
        assert_eq!(CommitOptions::reported(), CommitOptions::default());
        let options = CommitOptions::desired().cached();
        assert!(options.desired);
        assert!(options.cache);
    }

    #[test]
    fn test_shutdown() {
        let engine = engine();
        assert!(engine.dispatcher().owns_runtime());
        engine.shutdown();
    }
}
