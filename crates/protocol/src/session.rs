use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Opaque session identifier assigned by a transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a session as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Counters an engine keeps for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub files_complete: usize,
    /// Declared size of every file counted in `files_complete`.
    pub bytes_complete: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// A started session, owned by the orchestrator for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSessionHandle {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
}

impl TransferSessionHandle {
    pub fn new(session_id: SessionId, job_id: JobId) -> Self {
        Self {
            session_id,
            job_id,
            started_at: Utc::now(),
        }
    }
}
