//! Transport plugin contract and the engine core shared by the bundled
//! transports.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};
use uplink_protocol::{
    FileTransferUnit, ProgressEvent, SessionId, SessionStats, TransferJob, TransportKind,
};

use crate::chunked::Throttle;
use crate::deliver::{Delivery, DeliveryContext, DeliveryError};
use crate::tracker::SessionTracker;
use crate::{DEFAULT_CHUNK_SIZE, EngineInitError, TransportError};

/// Callback invoked on an engine thread for every event of every session.
pub type EngineListener = Arc<dyn Fn(&SessionId, &ProgressEvent) + Send + Sync>;

/// Handle returned by [`TransportEngine::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wraps an engine-chosen raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// What a transport back end must implement.
///
/// Engines are stateful and not safe for concurrent calls; callers go
/// through [`EngineGuard`](crate::EngineGuard). Listeners are invoked from
/// the engine's own threads.
pub trait TransportEngine: Send {
    /// The transport family this engine speaks.
    fn kind(&self) -> TransportKind;

    /// Starts moving `job`'s files and returns the new session's id.
    fn start_session(&mut self, job: &TransferJob) -> Result<SessionId, TransportError>;

    fn add_listener(&mut self, listener: EngineListener) -> ListenerId;

    /// Returns `false` if the id was not registered.
    fn remove_listener(&mut self, id: ListenerId) -> bool;

    /// Counters for a session, `None` if the engine never ran it.
    fn session_stats(&self, session_id: &SessionId) -> Option<SessionStats>;

    /// Asks a running session to stop. Completion is signalled by its
    /// terminal event.
    fn cancel_session(&mut self, session_id: &SessionId) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Listener registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Arc<RwLock<Vec<(ListenerId, EngineListener)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: EngineListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut list = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        list.len() != before
    }

    /// Calls every registered listener. The registry lock is not held while
    /// listeners run.
    pub(crate) fn emit(&self, session_id: &SessionId, event: &ProgressEvent) {
        let snapshot: Vec<EngineListener> = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(session_id, event);
        }
    }
}

// ---------------------------------------------------------------------------
// ArchiveEngine
// ---------------------------------------------------------------------------

/// Sessions an engine remembers, the running one included. Older finished
/// sessions are forgotten.
pub(crate) const SESSION_HISTORY: usize = 32;

/// Engine core delivering into an archive endpoint mounted at `root`.
///
/// The bundled transports differ only in their stream count and whether the
/// job's resume check applies.
pub(crate) struct ArchiveEngine {
    kind: TransportKind,
    root: PathBuf,
    chunk_size: usize,
    listeners: Listeners,
    sessions: HashMap<SessionId, Arc<SessionTracker>>,
    /// Session ids, oldest first.
    launched: VecDeque<SessionId>,
}

/// How a session spreads its files over worker threads.
pub(crate) struct SessionPlan {
    pub(crate) streams: usize,
    pub(crate) resume: bool,
}

impl ArchiveEngine {
    pub(crate) fn new(kind: TransportKind, root: PathBuf) -> Result<Self, EngineInitError> {
        if !root.is_dir() {
            return Err(EngineInitError::new(format!(
                "archive endpoint not mounted at {}",
                root.display()
            )));
        }
        Ok(Self {
            kind,
            root,
            chunk_size: DEFAULT_CHUNK_SIZE,
            listeners: Listeners::default(),
            sessions: HashMap::new(),
            launched: VecDeque::new(),
        })
    }

    pub(crate) fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub(crate) fn session_stats(&self, session_id: &SessionId) -> Option<SessionStats> {
        self.sessions.get(session_id).map(|t| t.stats())
    }

    pub(crate) fn cancel_session(&mut self, session_id: &SessionId) -> Result<(), TransportError> {
        let tracker = self
            .sessions
            .get(session_id)
            .ok_or_else(|| TransportError::SessionNotFound(session_id.to_string()))?;
        tracker.request_cancel();
        info!(session = %session_id, "cancel requested");
        Ok(())
    }

    /// Spawns the worker threads for `job` and returns immediately.
    pub(crate) fn launch(
        &mut self,
        job: &TransferJob,
        plan: SessionPlan,
    ) -> Result<SessionId, TransportError> {
        if job.transport() != self.kind {
            return Err(TransportError::Unsupported(format!(
                "{:?} job sent to {:?} engine",
                job.transport(),
                self.kind
            )));
        }
        if let Some((id, _)) = self.sessions.iter().find(|(_, t)| t.is_running()) {
            return Err(TransportError::Busy(id.to_string()));
        }

        let prefix = match self.kind {
            TransportKind::SingleStream => "ss",
            TransportKind::HighThroughput => "ht",
        };
        let session_id = SessionId::new(format!("{prefix}-{}", uuid::Uuid::new_v4()));
        let tracker = Arc::new(SessionTracker::new(job.files().len(), job.total_bytes()));

        let run = SessionRun {
            session_id: session_id.clone(),
            job: job.clone(),
            root: self.root.clone(),
            chunk_size: self.chunk_size,
            tracker: Arc::clone(&tracker),
            listeners: self.listeners.clone(),
            throttle: Throttle::new(job.parameters().rate_limit_bytes_per_sec),
            queue: Mutex::new(job.files().iter().cloned().collect()),
            failures: AtomicU64::new(0),
            resume: plan.resume,
        };

        let streams = plan.streams.max(1).min(job.files().len().max(1));
        std::thread::Builder::new()
            .name(format!("uplink-{prefix}-session"))
            .spawn(move || run.execute(streams))?;

        info!(
            session = %session_id,
            job = %job.job_id(),
            files = job.files().len(),
            streams,
            "session started"
        );
        self.sessions.insert(session_id.clone(), tracker);
        self.launched.push_back(session_id.clone());
        self.forget_finished();
        Ok(session_id)
    }

    /// Drops the oldest finished sessions beyond [`SESSION_HISTORY`].
    fn forget_finished(&mut self) {
        while self.launched.len() > SESSION_HISTORY {
            let sessions = &self.sessions;
            let Some(pos) = self
                .launched
                .iter()
                .position(|id| sessions.get(id).is_none_or(|t| !t.is_running()))
            else {
                break;
            };
            if let Some(id) = self.launched.remove(pos) {
                self.sessions.remove(&id);
                debug!(session = %id, "finished session forgotten");
            }
        }
    }
}

/// State shared by the worker threads of one session.
struct SessionRun {
    session_id: SessionId,
    job: TransferJob,
    root: PathBuf,
    chunk_size: usize,
    tracker: Arc<SessionTracker>,
    listeners: Listeners,
    throttle: Throttle,
    queue: Mutex<VecDeque<FileTransferUnit>>,
    failures: AtomicU64,
    resume: bool,
}

impl SessionRun {
    fn execute(self, streams: usize) {
        let run = &self;
        std::thread::scope(|scope| {
            for _ in 0..streams {
                scope.spawn(move || run.worker());
            }
        });

        let event = if self.tracker.cancel_requested() {
            for unit in self.drain_queue() {
                self.emit(ProgressEvent::Cancelled { unit });
            }
            self.tracker.mark_cancelled();
            ProgressEvent::SessionFailed {
                reason: "cancelled".into(),
            }
        } else {
            let failures = self.failures.load(Ordering::Relaxed);
            if failures > 0 {
                let reason = format!("{failures} file(s) failed");
                self.tracker.fail(&reason);
                ProgressEvent::SessionFailed { reason }
            } else {
                self.tracker.finish();
                ProgressEvent::SessionSucceeded
            }
        };
        debug!(session = %self.session_id, ?event, "session finished");
        self.emit(event);
    }

    fn worker(&self) {
        let ctx = DeliveryContext {
            root: &self.root,
            job: &self.job,
            tracker: &self.tracker,
            throttle: &self.throttle,
            resume: self.resume,
            chunk_size: self.chunk_size,
        };

        while !self.tracker.cancel_requested() {
            let Some(unit) = self.next_unit() else {
                break;
            };
            match ctx.deliver(&unit, || self.emit(self.tracker.progress())) {
                Ok(delivery) => {
                    self.tracker.complete_file(unit.size_bytes);
                    if delivery == Delivery::Skipped {
                        self.tracker.add_bytes(unit.size_bytes);
                    }
                    self.emit(self.tracker.progress());
                    self.emit(ProgressEvent::FileSuccess { unit });
                }
                Err(DeliveryError::Cancelled) => {
                    self.emit(ProgressEvent::Cancelled { unit });
                }
                Err(DeliveryError::Failed(message)) => {
                    warn!(
                        session = %self.session_id,
                        file = %unit.id(),
                        error = %message,
                        "file failed"
                    );
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.emit(ProgressEvent::FileError { unit, message });
                }
            }
        }
    }

    fn next_unit(&self) -> Option<FileTransferUnit> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    fn drain_queue(&self) -> Vec<FileTransferUnit> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn emit(&self, event: ProgressEvent) {
        self.listeners.emit(&self.session_id, &event);
    }
}
