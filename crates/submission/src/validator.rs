//! Post-session integrity gate.

use std::sync::Arc;

use tracing::{info, warn};
use uplink_protocol::{SessionState, TransferJob, TransferSessionHandle};
use uplink_transport::EngineGuard;

use crate::error::ValidationError;

/// Counters of a session that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validated {
    pub files_complete: usize,
    pub bytes_complete: u64,
}

/// Cross-checks an engine's session counters against the job manifest.
///
/// The engine's own terminal event is not trusted: a job only counts as
/// done when the stats account for every file and byte it carried.
pub struct SessionValidator {
    guard: Arc<EngineGuard>,
}

impl SessionValidator {
    pub fn new(guard: Arc<EngineGuard>) -> Self {
        Self { guard }
    }

    pub fn validate(
        &self,
        job: &TransferJob,
        handle: &TransferSessionHandle,
    ) -> Result<Validated, ValidationError> {
        let stats = self
            .guard
            .with_lock(|engine| engine.session_stats(&handle.session_id))?
            .ok_or_else(|| ValidationError::SessionNotFound(handle.session_id.clone()))?;

        let result = match stats.state {
            SessionState::Failed | SessionState::Cancelled => {
                Err(ValidationError::SessionReportedFailure {
                    reason: stats
                        .error_description
                        .clone()
                        .unwrap_or_else(|| format!("session {:?}", stats.state).to_lowercase()),
                })
            }
            SessionState::Running | SessionState::Completed => {
                let expected = job.files().len();
                let expected_bytes = job.total_bytes();
                if stats.files_complete < expected {
                    Err(ValidationError::IncompleteTransfer {
                        completed: stats.files_complete,
                        expected,
                    })
                } else if stats.bytes_complete < expected_bytes {
                    Err(ValidationError::ByteShortfall {
                        completed: stats.bytes_complete,
                        expected: expected_bytes,
                    })
                } else {
                    Ok(Validated {
                        files_complete: stats.files_complete,
                        bytes_complete: stats.bytes_complete,
                    })
                }
            }
        };

        match &result {
            Ok(v) => info!(
                job = %job.job_id(),
                session = %handle.session_id,
                files = v.files_complete,
                bytes = v.bytes_complete,
                "session validated"
            ),
            Err(e) => warn!(
                job = %job.job_id(),
                session = %handle.session_id,
                error = %e,
                "session failed validation"
            ),
        }
        result
    }
}
