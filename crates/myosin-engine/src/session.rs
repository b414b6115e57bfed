//! Scoped state sessions.
//!
//! A [`Session`] holds the session locks of every type it names for as long
//! as it lives. Locks are acquired in [`TypeTag`] order, so two sessions
//! naming the same types in a different order cannot deadlock, and released
//! on drop, including while unwinding.
//!
//! ```rust,ignore
//! let session = engine.open_async(&[TypeTag::of::<Telemetry>()]).await?;
//! let mut telemetry: Telemetry = session.checkout()?;
//! telemetry.temp = 60.0;
//! session.commit(&telemetry, CommitOptions::reported().cached())?;
//! // locks released here
//! ```

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use myosin_core::metrics::ACTIVE_CONTEXTS;
use myosin_core::{StateError, TypeTag};

use crate::dispatch::run_blocking;
use crate::state::StateEngine;

/// Per-type session lock. Held through an owned guard, so a session does not
/// borrow the wrapper that owns the lock.
pub(crate) type SessionLock = Mutex<()>;

/// A lock a session is about to acquire.
pub(crate) struct PendingLock {
    pub(crate) tag: TypeTag,
    pub(crate) lock: Arc<SessionLock>,
}

struct HeldLock {
    tag: TypeTag,
    _guard: OwnedMutexGuard<()>,
}

/// An open state session.
///
/// Derefs to [`StateEngine`], so every engine operation is available inside
/// the session.
pub struct Session<'a> {
    engine: &'a StateEngine,
    held: Vec<HeldLock>,
}

impl<'a> Session<'a> {
    fn begin(engine: &'a StateEngine, capacity: usize) -> Self {
        engine.metrics().add_gauge(ACTIVE_CONTEXTS, 1);
        Self {
            engine,
            held: Vec::with_capacity(capacity),
        }
    }

    fn hold(&mut self, tag: TypeTag, guard: OwnedMutexGuard<()>) {
        info!("Acquired {} state lock", tag);
        self.held.push(HeldLock { tag, _guard: guard });
    }

    /// Acquire `locks`, which must already be sorted and deduplicated,
    /// blocking the current thread.
    ///
    /// Fails with [`StateError::Runtime`] on a current-thread runtime. Locks
    /// taken before a failure are released when the partial session drops.
    pub(crate) fn acquire(engine: &'a StateEngine, locks: Vec<PendingLock>) -> Result<Self, StateError> {
        let mut session = Self::begin(engine, locks.len());
        for pending in locks {
            let guard = run_blocking(|| pending.lock.blocking_lock_owned())?;
            session.hold(pending.tag, guard);
        }
        Ok(session)
    }

    /// Acquire `locks` without blocking the executor.
    pub(crate) async fn acquire_async(engine: &'a StateEngine, locks: Vec<PendingLock>) -> Self {
        let mut session = Self::begin(engine, locks.len());
        for pending in locks {
            let guard = pending.lock.lock_owned().await;
            session.hold(pending.tag, guard);
        }
        session
    }

    /// Whether this session holds the lock of `tag`.
    pub fn holds(&self, tag: TypeTag) -> bool {
        self.held.iter().any(|entry| entry.tag == tag)
    }

    /// Types locked by this session, in acquisition order.
    pub fn locked_types(&self) -> Vec<TypeTag> {
        self.held.iter().map(|entry| entry.tag).collect()
    }

    pub fn engine(&self) -> &'a StateEngine {
        self.engine
    }
}

impl Deref for Session<'_> {
    type Target = StateEngine;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        while let Some(entry) = self.held.pop() {
            let tag = entry.tag;
            drop(entry);
            info!("Released {} state lock", tag);
        }
        self.engine.metrics().add_gauge(ACTIVE_CONTEXTS, -1);
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("locked_types", &self.locked_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myosin_core::{to_document, Document, EngineConfig, ModelError, ModelId, StateModel};
    use serde::Serialize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize)]
    struct Pump {
        rpm: u32,
    }

    impl StateModel for Pump {
        const TYPE_TAG: &'static str = "Pump";

        fn id(&self) -> Option<&ModelId> {
            None
        }

        fn dump(&self) -> Result<Document, ModelError> {
            to_document(self)
        }

        fn hydrate(&mut self, _document: &Document) -> Result<(), ModelError> {
            Ok(())
        }
    }

    fn engine() -> Arc<StateEngine> {
        let engine = StateEngine::new(EngineConfig::default()).unwrap();
        engine.load(Pump { rpm: 0 }).unwrap();
        Arc::new(engine)
    }

    #[test]
    fn test_session_blocks_second_holder() {
        let engine = engine();
        let session = engine.open(&[TypeTag::of::<Pump>()]).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = Arc::clone(&engine);
        let handle = thread::spawn(move || {
            let session = contender.open(&[TypeTag::of::<Pump>()]).unwrap();
            tx.send(session.locked_types()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(session);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            vec![TypeTag::of::<Pump>()]
        );
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_session_waits_for_release() {
        let engine = engine();
        let session = engine.open_async(&[TypeTag::of::<Pump>()]).await.unwrap();

        let contender = Arc::clone(&engine);
        let waiter = tokio::spawn(async move {
            let session = contender.open_async(&[TypeTag::of::<Pump>()]).await.unwrap();
            session.holds(TypeTag::of::<Pump>())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(session);
        assert!(tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_blocking_open_on_current_thread_runtime_fails() {
        let engine = engine();
        assert!(matches!(
            engine.open(&[TypeTag::of::<Pump>()]),
            Err(StateError::Runtime(_))
        ));
        // a failed open leaves the lock free
        let session = engine.open_async(&[TypeTag::of::<Pump>()]).await.unwrap();
        assert!(session.holds(TypeTag::of::<Pump>()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_open_on_multi_thread_runtime() {
        let engine = engine();
        let session = engine.open(&[TypeTag::of::<Pump>()]).unwrap();
        assert_eq!(session.locked_types(), vec![TypeTag::of::<Pump>()]);
    }
}
