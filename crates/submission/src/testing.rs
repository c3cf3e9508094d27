//! Scripted transport engine for the submission tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uplink_protocol::{
    Credentials, Destination, FileTransferUnit, ProgressEvent, SessionId, SessionState,
    SessionStats, TransferJob, TransferParameters, TransportKind,
};
use uplink_transport::{
    EngineGuard, EngineInitError, EngineListener, ListenerId, TransportEngine, TransportError,
};

/// Knobs and counters shared between a test and its engine.
#[derive(Default)]
pub(crate) struct Script {
    /// Number of upcoming `start_session` calls that fail.
    pub start_failures: AtomicU32,
    pub start_attempts: AtomicU32,
    /// Unit ids of every started job, in start order.
    pub started_jobs: Mutex<Vec<Vec<String>>>,
    /// Units reported as failed.
    pub failing: Mutex<Vec<String>>,
    /// Report success while leaving this many files out of the stats.
    pub unreported: AtomicUsize,
    /// Report success while leaving this many bytes out of the stats.
    pub missing_bytes: AtomicU64,
    /// Deliver this many files, then keep the session running until cancelled.
    pub stall_after: Mutex<Option<usize>>,
    pub cancels: AtomicU32,
    pub listeners: AtomicUsize,
    /// Forget sessions once they end.
    pub forget_sessions: AtomicBool,
    /// Runs once, at the next successful start, before any event is emitted.
    pub on_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

struct Running {
    session_id: SessionId,
    remaining: Vec<FileTransferUnit>,
    stats: SessionStats,
}

pub(crate) struct ScriptedEngine {
    script: Arc<Script>,
    listeners: Vec<(ListenerId, EngineListener)>,
    next_id: u64,
    sessions: HashMap<SessionId, SessionStats>,
    running: Option<Running>,
}

impl ScriptedEngine {
    /// A guard whose engine follows the returned script.
    pub(crate) fn guard() -> (Arc<EngineGuard>, Arc<Script>) {
        let script = Arc::new(Script::default());
        let s = Arc::clone(&script);
        let guard = EngineGuard::new(Box::new(
            move || -> Result<Box<dyn TransportEngine>, EngineInitError> {
                Ok(Box::new(ScriptedEngine {
                    script: Arc::clone(&s),
                    listeners: Vec::new(),
                    next_id: 0,
                    sessions: HashMap::new(),
                    running: None,
                }))
            },
        ));
        (Arc::new(guard), script)
    }

    fn emit(&self, session_id: &SessionId, event: ProgressEvent) {
        for (_, listener) in &self.listeners {
            listener(session_id, &event);
        }
    }

    fn finish(&mut self, session_id: SessionId, stats: SessionStats, terminal: ProgressEvent) {
        self.emit(&session_id, terminal);
        if !self.script.forget_sessions.load(Ordering::SeqCst) {
            self.sessions.insert(session_id, stats);
        }
    }
}

impl TransportEngine for ScriptedEngine {
    fn kind(&self) -> TransportKind {
        TransportKind::SingleStream
    }

    fn start_session(&mut self, job: &TransferJob) -> Result<SessionId, TransportError> {
        self.script.start_attempts.fetch_add(1, Ordering::SeqCst);
        let pending_failures = self.script.start_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.script
                .start_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(TransportError::Rejected("remote host unreachable".into()));
        }

        self.script
            .started_jobs
            .lock()
            .unwrap()
            .push(job.files().iter().map(|u| u.id().to_string()).collect());
        let hook = self.script.on_start.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        self.next_id += 1;
        let session_id = SessionId::new(format!("mock-{}", self.next_id));
        let failing = self.script.failing.lock().unwrap().clone();
        let stall_after = *self.script.stall_after.lock().unwrap();

        let mut stats = SessionStats {
            state: SessionState::Running,
            files_complete: 0,
            bytes_complete: 0,
            error_description: None,
        };
        let mut failed = 0;
        let mut files = job.files().to_vec();
        let remaining = match stall_after {
            Some(n) if n < files.len() => files.split_off(n),
            _ => Vec::new(),
        };

        for unit in files {
            stats.bytes_complete += unit.size_bytes;
            self.emit(
                &session_id,
                ProgressEvent::Progress {
                    bytes_total: job.total_bytes(),
                    bytes_transferred: stats.bytes_complete,
                    files_total: job.files().len(),
                    files_completed: stats.files_complete,
                },
            );
            if failing.iter().any(|f| f == unit.id()) {
                failed += 1;
                stats.bytes_complete -= unit.size_bytes;
                self.emit(
                    &session_id,
                    ProgressEvent::FileError {
                        unit,
                        message: "remote refused file".into(),
                    },
                );
            } else {
                stats.files_complete += 1;
                self.emit(&session_id, ProgressEvent::FileSuccess { unit });
            }
        }

        if stall_after.is_some_and(|n| n < job.files().len()) {
            self.running = Some(Running {
                session_id: session_id.clone(),
                remaining,
                stats,
            });
            return Ok(session_id);
        }

        if failed > 0 {
            let reason = format!("{failed} file(s) failed");
            stats.state = SessionState::Failed;
            stats.error_description = Some(reason.clone());
            self.finish(session_id.clone(), stats, ProgressEvent::SessionFailed { reason });
        } else {
            let unreported = self.script.unreported.load(Ordering::SeqCst);
            stats.files_complete = stats.files_complete.saturating_sub(unreported);
            let missing_bytes = self.script.missing_bytes.load(Ordering::SeqCst);
            stats.bytes_complete = stats.bytes_complete.saturating_sub(missing_bytes);
            stats.state = SessionState::Completed;
            self.finish(session_id.clone(), stats, ProgressEvent::SessionSucceeded);
        }
        Ok(session_id)
    }

    fn add_listener(&mut self, listener: EngineListener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId::new(self.next_id);
        self.listeners.push((id, listener));
        self.script.listeners.fetch_add(1, Ordering::SeqCst);
        id
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        let removed = self.listeners.len() != before;
        if removed {
            self.script.listeners.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    fn session_stats(&self, session_id: &SessionId) -> Option<SessionStats> {
        match &self.running {
            Some(r) if &r.session_id == session_id => Some(r.stats.clone()),
            _ => self.sessions.get(session_id).cloned(),
        }
    }

    fn cancel_session(&mut self, session_id: &SessionId) -> Result<(), TransportError> {
        self.script.cancels.fetch_add(1, Ordering::SeqCst);
        let Some(running) = self.running.take_if(|r| &r.session_id == session_id) else {
            return Err(TransportError::SessionNotFound(session_id.to_string()));
        };
        for unit in running.remaining {
            self.emit(session_id, ProgressEvent::Cancelled { unit });
        }
        let mut stats = running.stats;
        stats.state = SessionState::Cancelled;
        self.finish(
            running.session_id,
            stats,
            ProgressEvent::SessionFailed {
                reason: "cancelled".into(),
            },
        );
        Ok(())
    }
}

/// A job of `n` units: `n - 1` data files plus a protected checksum list.
pub(crate) fn sample_job(n: usize) -> TransferJob {
    let mut files: Vec<FileTransferUnit> = (0..n.saturating_sub(1))
        .map(|i| {
            FileTransferUnit::new(
                format!("/data/run/file{i}.fastq.gz"),
                format!("run/file{i}.fastq.gz"),
                100,
            )
        })
        .collect();
    if n > 0 {
        files.push(FileTransferUnit::new("/data/run/md5sums.txt", "md5sums.txt", 10).protected());
    }
    job_with(files)
}

pub(crate) fn job_with(files: Vec<FileTransferUnit>) -> TransferJob {
    TransferJob::new(
        "sub-test",
        TransportKind::SingleStream,
        Destination {
            host: "archive.test".into(),
            credentials: Credentials {
                username: "submitter".into(),
                secret: "secret".into(),
            },
            remote_path: "incoming".into(),
        },
        files,
        TransferParameters::default(),
    )
    .unwrap()
}
