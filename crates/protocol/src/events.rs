//! Events raised by transports while a session runs.

use serde::{Deserialize, Serialize};

use crate::{FileTransferUnit, JobId, SessionId};

/// Progress notification emitted by a transport.
///
/// Exactly one terminal event ([`SessionFailed`](Self::SessionFailed) or
/// [`SessionSucceeded`](Self::SessionSucceeded)) is emitted per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        bytes_total: u64,
        bytes_transferred: u64,
        files_total: usize,
        files_completed: usize,
    },
    FileSuccess {
        unit: FileTransferUnit,
    },
    FileError {
        unit: FileTransferUnit,
        message: String,
    },
    Cancelled {
        unit: FileTransferUnit,
    },
    SessionFailed {
        reason: String,
    },
    SessionSucceeded,
}

impl ProgressEvent {
    /// Returns `true` for the events that end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionFailed { .. } | Self::SessionSucceeded)
    }

    /// The file this event concerns, if any.
    pub fn unit(&self) -> Option<&FileTransferUnit> {
        match self {
            Self::FileSuccess { unit }
            | Self::FileError { unit, .. }
            | Self::Cancelled { unit } => Some(unit),
            _ => None,
        }
    }
}

/// A [`ProgressEvent`] tagged with the job and session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub event: ProgressEvent,
}
