use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use uplink_protocol::{ProgressEvent, SessionState, SessionStats};

/// Engine-side bookkeeping for one session (thread-safe).
///
/// Worker threads update it while copying; the engine reads it to answer
/// stats queries.
pub(crate) struct SessionTracker {
    inner: RwLock<TrackerInner>,
    cancel_requested: AtomicBool,
}

struct TrackerInner {
    state: SessionState,
    files_total: usize,
    files_complete: usize,
    bytes_total: u64,
    bytes_transferred: u64,
    bytes_complete: u64,
    error: Option<String>,
}

impl SessionTracker {
    pub(crate) fn new(files_total: usize, bytes_total: u64) -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                state: SessionState::Running,
                files_total,
                files_complete: 0,
                bytes_total,
                bytes_transferred: 0,
                bytes_complete: 0,
                error: None,
            }),
            cancel_requested: AtomicBool::new(false),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds freshly sent bytes.
    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.write().bytes_transferred += bytes;
    }

    /// Counts a confirmed file of the given declared size.
    pub(crate) fn complete_file(&self, size: u64) {
        let mut s = self.write();
        s.files_complete += 1;
        s.bytes_complete += size;
    }

    /// Ends the session successfully.
    pub(crate) fn finish(&self) {
        let mut s = self.write();
        if s.state == SessionState::Running {
            s.state = SessionState::Completed;
        }
    }

    /// Ends the session with an error.
    pub(crate) fn fail(&self, err: &str) {
        let mut s = self.write();
        s.state = SessionState::Failed;
        s.error = Some(err.to_string());
    }

    /// Ends the session as cancelled.
    pub(crate) fn mark_cancelled(&self) {
        let mut s = self.write();
        s.state = SessionState::Cancelled;
        s.error = Some("cancelled".into());
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Relaxed);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.read().state == SessionState::Running
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let s = self.read();
        SessionStats {
            state: s.state,
            files_complete: s.files_complete,
            bytes_complete: s.bytes_complete,
            error_description: s.error.clone(),
        }
    }

    /// Snapshot of the counters as a progress event.
    pub(crate) fn progress(&self) -> ProgressEvent {
        let s = self.read();
        ProgressEvent::Progress {
            bytes_total: s.bytes_total,
            bytes_transferred: s.bytes_transferred,
            files_total: s.files_total,
            files_completed: s.files_complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_tracker_is_running() {
        let t = SessionTracker::new(2, 300);
        assert!(t.is_running());
        assert_eq!(t.stats().files_complete, 0);
    }

    #[test]
    fn counts_bytes_and_files() {
        let t = SessionTracker::new(2, 300);
        t.add_bytes(100);
        t.complete_file(100);
        assert_eq!(
            t.progress(),
            ProgressEvent::Progress {
                bytes_total: 300,
                bytes_transferred: 100,
                files_total: 2,
                files_completed: 1,
            }
        );
        assert_eq!(t.stats().bytes_complete, 100);
    }

    #[test]
    fn finish_does_not_override_failure() {
        let t = SessionTracker::new(1, 1);
        t.fail("disk full");
        t.finish();
        let stats = t.stats();
        assert_eq!(stats.state, SessionState::Failed);
        assert_eq!(stats.error_description.as_deref(), Some("disk full"));
    }

    #[test]
    fn cancel_flag() {
        let t = SessionTracker::new(1, 1);
        assert!(!t.cancel_requested());
        t.request_cancel();
        assert!(t.cancel_requested());
        t.mark_cancelled();
        assert_eq!(t.stats().state, SessionState::Cancelled);
    }

    #[test]
    fn concurrent_updates() {
        let t = Arc::new(SessionTracker::new(1000, 1000));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for _ in 0..100 {
                        t.add_bytes(1);
                        t.complete_file(1);
                        let _ = t.progress();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.stats().files_complete, 1000);
        assert_eq!(t.stats().bytes_complete, 1000);
    }
}
