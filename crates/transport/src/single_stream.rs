use std::path::PathBuf;

use uplink_protocol::{SessionId, SessionStats, TransferJob, TransportKind};

use crate::engine::{ArchiveEngine, SessionPlan};
use crate::guard::EngineFactory;
use crate::{EngineInitError, EngineListener, ListenerId, TransportEngine, TransportError};

/// Sequential transport: one stream, every file confirmed (size, then
/// checksum when the manifest has one) before the next one starts.
///
/// Files already at the destination are handled by the job's overwrite
/// policy only; this transport has no resume check of its own.
pub struct SingleStreamTransport {
    core: ArchiveEngine,
}

impl SingleStreamTransport {
    /// Opens a transport delivering below `root`, the mounted archive endpoint.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineInitError> {
        Ok(Self {
            core: ArchiveEngine::new(TransportKind::SingleStream, root.into())?,
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

impl TransportEngine for SingleStreamTransport {
    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn start_session(&mut self, job: &TransferJob) -> Result<SessionId, TransportError> {
        self.core.launch(
            job,
            SessionPlan {
                streams: 1,
                resume: false,
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
