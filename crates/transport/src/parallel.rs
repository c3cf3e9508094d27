use std::path::PathBuf;

use uplink_protocol::{ResumeCheck, SessionId, SessionStats, TransferJob, TransportKind};

use crate::engine::{ArchiveEngine, SessionPlan};
use crate::guard::EngineFactory;
use crate::{EngineInitError, EngineListener, ListenerId, TransportEngine, TransportError};

/// High-throughput transport: `parallel_streams` concurrent streams pulling
/// from one queue.
///
/// Files the destination already holds are skipped according to the job's
/// resume check (size or SHA-256 comparison). Across files, events arrive in
/// completion order, not manifest order.
pub struct ParallelStreamTransport {
    core: ArchiveEngine,
}

impl ParallelStreamTransport {
    /// Opens a transport delivering below `root`, the mounted archive endpoint.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineInitError> {
        Ok(Self {
            core: ArchiveEngine::new(TransportKind::HighThroughput, root.into())?,
        })
    }

    /// Overrides the copy chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.core.set_chunk_size(chunk_size);
        self
    }

    /// Factory for an [`EngineGuard`](crate::EngineGuard).
    pub fn factory(root: impl Into<PathBuf>) -> EngineFactory {
        let root = root.into();
        Box::new(move || -> Result<Box<dyn TransportEngine>, EngineInitError> {
            Ok(Box::new(Self::new(root.clone())?))
        })
    }
}

impl TransportEngine for ParallelStreamTransport {
    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn start_session(&mut self, job: &TransferJob) -> Result<SessionId, TransportError> {
        let params = job.parameters();
        self.core.launch(
            job,
            SessionPlan {
                streams: params.parallel_streams,
                resume: params.resume_check != ResumeCheck::None,
            },
        )
    }

    fn add_listener(&mut self, listener: EngineListener) -> ListenerId {
        self.core.listeners().add(listener)
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.core.listeners().remove(id)
    }

    fn session_stats(&self, session_id: &SessionId) -> Option<SessionStats> {
        self.core.session_stats(session_id)
    }

    fn cancel_session(&mut self, session_id: &SessionId) -> Result<(), TransportError> {
        self.core.cancel_session(session_id)
    }
}
