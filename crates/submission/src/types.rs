//! Data types for the submission flow.

use uplink_protocol::JobId;

use crate::error::{StartError, SubmitError, ValidationError};

/// Lifecycle of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Starting,
    Transferring,
    Validating,
    Succeeded,
    Failed,
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ProtectedUnitMissing,
    EngineInit,
    TransferStart,
    SessionNotFound,
    SessionReportedFailure,
    IncompleteTransfer,
    Persistence,
    EventStreamClosed,
    Cancelled,
}

impl FailureKind {
    /// Whether resubmitting the same job can make progress without
    /// operator action.
    pub fn is_resumable(self) -> bool {
        !matches!(self, Self::ProtectedUnitMissing | Self::EngineInit)
    }
}

impl From<&SubmitError> for FailureKind {
    fn from(e: &SubmitError) -> Self {
        match e {
            SubmitError::ProtectedUnitMissing(_) => Self::ProtectedUnitMissing,
            SubmitError::Persistence(_) => Self::Persistence,
            SubmitError::Start(StartError::EngineInit(_)) => Self::EngineInit,
            SubmitError::Start(StartError::Exhausted { .. }) => Self::TransferStart,
            SubmitError::Start(StartError::Cancelled) | SubmitError::Cancelled => Self::Cancelled,
            SubmitError::Validation(v) => match v {
                ValidationError::SessionNotFound(_) => Self::SessionNotFound,
                ValidationError::SessionReportedFailure { .. } => Self::SessionReportedFailure,
                ValidationError::IncompleteTransfer { .. }
                | ValidationError::ByteShortfall { .. } => Self::IncompleteTransfer,
                ValidationError::EngineInit(_) => Self::EngineInit,
            },
            SubmitError::EventStreamClosed => Self::EventStreamClosed,
        }
    }
}

/// Final result of [`SessionOrchestrator::submit`](crate::SessionOrchestrator::submit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every pending unit was delivered and the session passed validation.
    Success {
        job_id: JobId,
        files_transferred: usize,
        bytes_transferred: u64,
    },
    /// Every unit was already confirmed by an earlier attempt; no session ran.
    AlreadyComplete { job_id: JobId },
    Failure {
        job_id: JobId,
        kind: FailureKind,
        detail: String,
        /// Units of the job not yet confirmed, in manifest order.
        outstanding: Vec<String>,
    },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure { .. })
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Success { job_id, .. }
            | Self::AlreadyComplete { job_id }
            | Self::Failure { job_id, .. } => job_id,
        }
    }
}
