//! # Subscriber dispatch.
//!
//! Every commit that selects at least one event schedules a dispatch round.
//! The runtime is resolved when the round is scheduled, not when the engine
//! is built:
//! - the runtime owned by the [`Dispatcher`], if it started one
//! - otherwise the ambient runtime of the committing thread
//! - otherwise a multi-threaded runtime started on demand and owned from then on
//!
//! ```text
//! commit()
//!     │
//!     └──► spawn(round) ──┬──► spawn(cb 1) ──► Ok / Err / panic
//!                         ├──► spawn(cb 2) ──► Ok / Err / panic
//!                         └──► spawn(cb N)
//!                                  │
//!                 join all ◄───────┘ ──► DispatchReport ──► DispatchHandle
//! ```
//!
//! ## Rules
//! - **Concurrent**: callbacks of one round run as sibling tasks
//! - **Isolation**: an erroring or panicking callback never affects siblings
//!   and never reaches the committer; it is logged and counted
//! - **Counting**: each event's execution counter increments once per
//!   completed invocation, whatever the outcome
//! - **Fire-and-forget**: dropping the [`DispatchHandle`] detaches the round

use std::any::Any;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use myosin_core::metrics::{Metrics, CALLBACK_EXCEPTIONS};
use myosin_core::{Document, EngineConfig, StateError, StateModel, TypeTag};

use crate::event::{Event, SubscriptionId, Trigger};

/// A callback invocation that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackFailure {
    pub subscription: SubscriptionId,
    pub name: String,
    pub message: String,
    pub panicked: bool,
}

/// Outcome of one dispatch round.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub type_tag: TypeTag,
    pub trigger: Trigger,
    /// Number of callbacks scheduled in this round.
    pub invoked: usize,
    pub failures: Vec<CallbackFailure>,
    /// False if the runtime shut down before the round finished.
    pub completed: bool,
}

impl DispatchReport {
    fn idle(type_tag: TypeTag, trigger: Trigger) -> Self {
        Self {
            type_tag,
            trigger,
            invoked: 0,
            failures: Vec::new(),
            completed: true,
        }
    }

    fn aborted(type_tag: TypeTag, trigger: Trigger) -> Self {
        Self {
            completed: false,
            ..Self::idle(type_tag, trigger)
        }
    }

    /// Round finished and every callback succeeded.
    pub fn is_clean(&self) -> bool {
        self.completed && self.failures.is_empty()
    }
}

enum HandleState {
    Ready(DispatchReport),
    Pending(oneshot::Receiver<DispatchReport>),
}

/// Handle to a scheduled dispatch round.
pub struct DispatchHandle {
    type_tag: TypeTag,
    trigger: Trigger,
    state: HandleState,
}

impl DispatchHandle {
    pub(crate) fn idle(type_tag: TypeTag, trigger: Trigger) -> Self {
        Self {
            type_tag,
            trigger,
            state: HandleState::Ready(DispatchReport::idle(type_tag, trigger)),
        }
    }

    /// Whether the commit scheduled no callbacks at all.
    pub fn is_idle(&self) -> bool {
        matches!(&self.state, HandleState::Ready(report) if report.invoked == 0)
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Await the end of the round.
    pub async fn join(self) -> DispatchReport {
        match self.state {
            HandleState::Ready(report) => report,
            HandleState::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| DispatchReport::aborted(self.type_tag, self.trigger)),
        }
    }

    /// Block the current thread until the round ends.
    ///
    /// Inside a multi-threaded runtime the worker is handed off with
    /// `block_in_place`. Inside a current-thread runtime the round could never
    /// make progress, so this fails with [`StateError::Runtime`]; use
    /// [`join`](Self::join) there.
    pub fn wait(self) -> Result<DispatchReport, StateError> {
        let (type_tag, trigger) = (self.type_tag, self.trigger);
        match self.state {
            HandleState::Ready(report) => Ok(report),
            HandleState::Pending(rx) => run_blocking(|| rx.blocking_recv()).map(|received| {
                received.unwrap_or_else(|_| DispatchReport::aborted(type_tag, trigger))
            }),
        }
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("type_tag", &self.type_tag)
            .field("trigger", &self.trigger)
            .field("idle", &self.is_idle())
            .finish()
    }
}

/// Resolves the runtime subscriber callbacks run on.
pub struct Dispatcher {
    workers: usize,
    owned: Mutex<Option<Runtime>>,
}

impl Dispatcher {
    /// Use the ambient tokio runtime, or start a dedicated one.
    ///
    /// The ambient runtime is not captured: every round looks it up again, so
    /// the dispatcher outlives the runtime it was built in.
    pub fn new(config: &EngineConfig) -> Result<Self, StateError> {
        let workers = config.effective_dispatch_workers();
        if Handle::try_current().is_ok() {
            debug!("Detected running tokio runtime, dispatching onto it");
            return Ok(Self {
                workers,
                owned: Mutex::new(None),
            });
        }

        Ok(Self {
            workers,
            owned: Mutex::new(Some(build_runtime(workers)?)),
        })
    }

    /// Whether the dispatcher started (and will tear down) its own runtime.
    pub fn owns_runtime(&self) -> bool {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Handle of the runtime the next round runs on.
    fn runtime_handle(&self) -> Result<Handle, StateError> {
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = owned.as_ref() {
            return Ok(runtime.handle().clone());
        }
        if let Ok(handle) = Handle::try_current() {
            return Ok(handle);
        }

        let runtime = build_runtime(self.workers)?;
        let handle = runtime.handle().clone();
        *owned = Some(runtime);
        Ok(handle)
    }

    /// Schedule one dispatch round.
    ///
    /// Fails only if no runtime is running and none can be started.
    pub(crate) fn dispatch<T: StateModel>(
        &self,
        trigger: Trigger,
        events: Vec<Arc<Event<T>>>,
        model: Arc<T>,
        delta: Arc<Document>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<DispatchHandle, StateError> {
        let type_tag = TypeTag::of::<T>();
        if events.is_empty() {
            return Ok(DispatchHandle::idle(type_tag, trigger));
        }

        let runtime = self.runtime_handle()?;

        debug!(
            "Scheduling {} {:?} callback(s) for {}",
            events.len(),
            trigger,
            type_tag
        );
        let (tx, rx) = oneshot::channel();
        runtime.spawn(async move {
            let report = run_round(trigger, events, model, delta, metrics).await;
            let _ = tx.send(report);
        });

        Ok(DispatchHandle {
            type_tag,
            trigger,
            state: HandleState::Pending(rx),
        })
    }

    /// Stop an owned runtime. In-flight rounds are abandoned; a later round
    /// starts a fresh runtime.
    pub fn shutdown(&self) {
        let runtime = self
            .owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            info!("Dispatch runtime shut down");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime(workers: usize) -> Result<Runtime, StateError> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("myosin-dispatch")
        .enable_all()
        .build()
        .map_err(|e| StateError::Runtime(e.to_string()))?;
    debug!("Started dispatch runtime with {} worker(s)", workers);
    Ok(runtime)
}

/// Run blocking work from any context.
///
/// Outside a runtime `f` runs directly. On a multi-threaded runtime it runs
/// under `block_in_place`. A current-thread runtime cannot be blocked.
pub(crate) fn run_blocking<R>(f: impl FnOnce() -> R) -> Result<R, StateError> {
    match Handle::try_current() {
        Err(_) => Ok(f()),
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(f))
        }
        Ok(_) => Err(StateError::Runtime(
            "cannot block inside a current-thread runtime, await instead".to_string(),
        )),
    }
}

async fn run_round<T: StateModel>(
    trigger: Trigger,
    events: Vec<Arc<Event<T>>>,
    model: Arc<T>,
    delta: Arc<Document>,
    metrics: Arc<dyn Metrics>,
) -> DispatchReport {
    let type_tag = TypeTag::of::<T>();

    let tasks: Vec<_> = events
        .iter()
        .map(|event| {
            let event = Arc::clone(event);
            let model = Arc::clone(&model);
            let delta = Arc::clone(&delta);
            tokio::spawn(async move { event.invoke(model, delta).await })
        })
        .collect();

    let mut failures = Vec::new();
    for (event, task) in events.iter().zip(tasks) {
        let outcome = task.await;
        event.record_execution();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some((format_error_chain(err.as_ref()), false)),
            Err(join_err) if join_err.is_panic() => {
                Some((panic_message(join_err.into_panic()), true))
            }
            Err(join_err) => Some((join_err.to_string(), false)),
        };

        if let Some((message, panicked)) = failure {
            metrics.increment_counter(CALLBACK_EXCEPTIONS, type_tag.as_str());
            error!(
                subscription = %event.id(),
                panicked,
                "Subscriber function {} on {} encountered an exception: {}",
                event.name(),
                type_tag,
                message
            );
            failures.push(CallbackFailure {
                subscription: event.id(),
                name: event.name().to_string(),
                message,
                panicked,
            });
        }
    }

    debug!(
        "{} subscriber operations: {} invoked, {} failed",
        type_tag,
        events.len(),
        failures.len()
    );

    DispatchReport {
        type_tag,
        trigger,
        invoked: events.len(),
        failures,
        completed: true,
    }
}

/// Render an error and its source chain on one line.
fn format_error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked: unknown panic".to_string()
    }
}
