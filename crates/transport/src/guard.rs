//! Serialized access to the process-wide transport engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use crate::{EngineInitError, TransportEngine};

/// Constructs the engine on first use.
pub type EngineFactory =
    Box<dyn Fn() -> Result<Box<dyn TransportEngine>, EngineInitError> + Send + Sync>;

enum EngineSlot {
    Empty,
    Ready(Box<dyn TransportEngine>),
    Failed(EngineInitError),
}

/// Single access point to the transport engine.
///
/// The engine is built lazily by the first [`acquire`](Self::acquire) and
/// every call into it (session start, listener (de)registration, stats,
/// cancel) runs under one lock. Create one guard at process start and share
/// it behind an `Arc`.
///
/// A failed construction is sticky: every later `acquire` reports the same
/// error until [`reset`](Self::reset).
pub struct EngineGuard {
    factory: EngineFactory,
    initialized: AtomicBool,
    slot: Mutex<EngineSlot>,
    /// Held for the whole lifetime of a session attempt.
    session_slot: tokio::sync::Mutex<()>,
}

/// Proof that the engine has been constructed.
pub struct EngineRef<'a> {
    guard: &'a EngineGuard,
}

impl EngineRef<'_> {
    /// Runs `f` with exclusive access to the engine.
    ///
    /// `f` must not call back into the guard.
    pub fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut dyn TransportEngine) -> R,
    ) -> Result<R, EngineInitError> {
        let mut slot = self.guard.lock_slot();
        match &mut *slot {
            EngineSlot::Ready(engine) => Ok(f(engine.as_mut())),
            EngineSlot::Failed(e) => Err(e.clone()),
            EngineSlot::Empty => Err(EngineInitError::new("engine was reset")),
        }
    }
}

impl EngineGuard {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            factory,
            initialized: AtomicBool::new(false),
            slot: Mutex::new(EngineSlot::Empty),
            session_slot: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, EngineSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the engine if needed. Safe to call from many threads; only the
    /// first caller constructs it.
    pub fn acquire(&self) -> Result<EngineRef<'_>, EngineInitError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(EngineRef { guard: self });
        }

        let mut slot = self.lock_slot();
        match &*slot {
            EngineSlot::Ready(_) => return Ok(EngineRef { guard: self }),
            EngineSlot::Failed(e) => return Err(e.clone()),
            EngineSlot::Empty => {}
        }

        match (self.factory)() {
            Ok(engine) => {
                info!(kind = ?engine.kind(), "transport engine initialized");
                *slot = EngineSlot::Ready(engine);
                self.initialized.store(true, Ordering::Release);
                Ok(EngineRef { guard: self })
            }
            Err(e) => {
                error!(error = %e, "transport engine initialization failed");
                *slot = EngineSlot::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Shorthand for `acquire()?.with_lock(f)`.
    pub fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut dyn TransportEngine) -> R,
    ) -> Result<R, EngineInitError> {
        self.acquire()?.with_lock(f)
    }

    /// Drops the engine (or the recorded failure) so the next `acquire`
    /// constructs a fresh one.
    pub fn reset(&self) {
        let mut slot = self.lock_slot();
        self.initialized.store(false, Ordering::Release);
        *slot = EngineSlot::Empty;
        info!("transport engine reset");
    }

    /// Waits until no other session attempt is in flight on this guard.
    pub async fn claim_session_slot(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.session_slot.lock().await
    }
}
