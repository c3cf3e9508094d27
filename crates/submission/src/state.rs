//! Durable per-submission upload state.
//!
//! One JSON record per submission id, rewritten after every mutation so a
//! restarted process resumes from the last confirmed file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uplink_protocol::{FileTransferUnit, TransferJob};

use crate::error::PersistenceError;

/// Distinguishes temporary files of concurrent saves within one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// The persisted form of a submission's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionState {
    pub submission_id: String,
    /// Identifiers of units confirmed at the destination.
    pub uploaded_files: BTreeSet<String>,
    pub summary_artifact_uploaded: bool,
    /// Protected units any job for this submission has carried.
    #[serde(default)]
    pub required_protected: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionState {
    fn empty(submission_id: &str) -> Self {
        Self {
            submission_id: submission_id.to_string(),
            uploaded_files: BTreeSet::new(),
            summary_artifact_uploaded: false,
            required_protected: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Directory of submission records.
#[derive(Debug, Clone)]
pub struct SubmissionStore {
    dir: PathBuf,
}

impl SubmissionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, submission_id: &str) -> Result<PathBuf, PersistenceError> {
        validate_submission_id(submission_id)?;
        Ok(self.dir.join(format!("{submission_id}.json")))
    }

    /// Reads the record for `submission_id`, `None` if there is none.
    pub fn load(&self, submission_id: &str) -> Result<Option<SubmissionRecord>, PersistenceError> {
        let path = self.record_path(submission_id)?;
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: SubmissionState =
            serde_json::from_str(&data).map_err(|e| PersistenceError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if state.submission_id != submission_id {
            return Err(PersistenceError::Corrupt {
                path,
                reason: format!("record belongs to submission {:?}", state.submission_id),
            });
        }
        debug!(
            submission = submission_id,
            uploaded = state.uploaded_files.len(),
            "loaded submission state"
        );
        Ok(Some(SubmissionRecord { path, state }))
    }

    /// Loads the record, or creates and persists an empty one.
    pub fn open(&self, submission_id: &str) -> Result<SubmissionRecord, PersistenceError> {
        if let Some(record) = self.load(submission_id)? {
            return Ok(record);
        }
        let mut record = SubmissionRecord {
            path: self.record_path(submission_id)?,
            state: SubmissionState::empty(submission_id),
        };
        record.save()?;
        info!(submission = submission_id, "created submission state");
        Ok(record)
    }

    /// Removes the record. Returns `false` if there was none.
    pub fn delete(&self, submission_id: &str) -> Result<bool, PersistenceError> {
        let path = self.record_path(submission_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(submission = submission_id, "deleted submission state");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// An open submission record bound to its file.
#[derive(Debug)]
pub struct SubmissionRecord {
    path: PathBuf,
    state: SubmissionState,
}

impl SubmissionRecord {
    pub fn state(&self) -> &SubmissionState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_uploaded(&self, unit: &FileTransferUnit) -> bool {
        self.state.uploaded_files.contains(unit.id())
    }

    /// Records `unit` as confirmed and persists before returning.
    ///
    /// Returns `Ok(false)` without writing if it was already recorded. On a
    /// failed write the in-memory state is rolled back so the unit is sent
    /// again on the next attempt.
    pub fn mark_uploaded(&mut self, unit: &FileTransferUnit) -> Result<bool, PersistenceError> {
        if self.is_uploaded(unit) {
            return Ok(false);
        }
        let previous = self.state.clone();
        self.state.uploaded_files.insert(unit.id().to_string());
        if unit.is_protected() {
            self.state.summary_artifact_uploaded = true;
        }
        if let Err(e) = self.save() {
            self.state = previous;
            return Err(e);
        }
        debug!(submission = %self.state.submission_id, file = unit.id(), "marked uploaded");
        Ok(true)
    }

    /// Adds `ids` to the set of protected units later jobs must carry.
    /// Returns `Ok(true)` if the set grew.
    pub fn require_protected<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<bool, PersistenceError> {
        let previous = self.state.clone();
        let mut grew = false;
        for id in ids {
            grew |= self.state.required_protected.insert(id.to_string());
        }
        if !grew {
            return Ok(false);
        }
        if let Err(e) = self.save() {
            self.state = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// Required protected units that `job` does not carry.
    pub fn missing_protected(&self, job: &TransferJob) -> Vec<String> {
        self.state
            .required_protected
            .iter()
            .filter(|id| !job.files().iter().any(|u| u.is_protected() && u.id() == id.as_str()))
            .cloned()
            .collect()
    }

    /// Writes the record to a temporary file and renames it into place.
    pub fn save(&mut self) -> Result<(), PersistenceError> {
        self.state.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&self.state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp = PathBuf::from(tmp);
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Submission ids become file names: ASCII alphanumerics, `-`, `_` and `.`,
/// not starting with a dot.
fn validate_submission_id(id: &str) -> Result<(), PersistenceError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidId(id.to_string()))
    }
}
