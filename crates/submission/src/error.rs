//! Submission error types.

use std::path::PathBuf;

use uplink_protocol::SessionId;
use uplink_transport::EngineInitError;

/// Errors reading or writing a persisted submission record.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The record exists but cannot be parsed. It is left on disk untouched.
    #[error("corrupt submission record {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("invalid submission id: {0:?}")]
    InvalidId(String),
}

/// Errors from [`RetryingSessionStarter::start`](crate::RetryingSessionStarter::start).
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    EngineInit(#[from] EngineInitError),

    #[error("session start failed after {attempts} attempt(s): {last_cause}")]
    Exhausted { attempts: u32, last_cause: String },

    #[error("cancelled")]
    Cancelled,
}

/// Reasons a finished session is not accepted as complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("engine has no record of session {0}")]
    SessionNotFound(SessionId),

    #[error("session reported failure: {reason}")]
    SessionReportedFailure { reason: String },

    #[error("incomplete transfer: {completed} of {expected} file(s) confirmed")]
    IncompleteTransfer { completed: usize, expected: usize },

    #[error("byte shortfall: {completed} of {expected} byte(s) confirmed")]
    ByteShortfall { completed: u64, expected: u64 },

    #[error(transparent)]
    EngineInit(#[from] EngineInitError),
}

/// Everything that can end a submission attempt early.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job is missing protected unit(s) required by earlier attempts: {}", .0.join(", "))]
    ProtectedUnitMissing(Vec<String>),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("event stream closed before the session finished")]
    EventStreamClosed,

    #[error("cancelled")]
    Cancelled,
}
