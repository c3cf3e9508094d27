//! Transfer job description: what to send, where, and how.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{validate_remote_root, validate_unit_path};

/// Errors raised while assembling a job from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("submission id is empty")]
    EmptySubmissionId,

    #[error("duplicate manifest entry: {0}")]
    DuplicateUnit(String),

    #[error("unit path {path:?} {reason}")]
    InvalidUnitPath { path: String, reason: &'static str },

    #[error("remote root {root:?} {reason}")]
    InvalidRemoteRoot { root: String, reason: &'static str },

    #[error("manifest carries {0} protected units, at most one is allowed")]
    MultipleProtected(usize),
}

/// Unique identifier of a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random job id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport family a job is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Sequential per-file copy with synchronous confirmation.
    SingleStream,
    /// Engine-managed parallel streams with native resume checks.
    HighThroughput,
}

/// Whether a manifest entry may be dropped by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    /// Must stay in every later job of the submission once it has appeared
    /// (the integrity manifest, for instance).
    Protected,
    #[default]
    Removable,
}

/// One file of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferUnit {
    pub local_path: PathBuf,
    /// Path below the destination root, `/`-separated.
    pub remote_relative_path: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest computed upstream, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub role: UnitRole,
}

impl FileTransferUnit {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_relative_path: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_relative_path: remote_relative_path.into(),
            size_bytes,
            checksum: None,
            role: UnitRole::Removable,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn protected(mut self) -> Self {
        self.role = UnitRole::Protected;
        self
    }

    /// Stable identifier used for resume bookkeeping.
    pub fn id(&self) -> &str {
        &self.remote_relative_path
    }

    pub fn is_protected(&self) -> bool {
        self.role == UnitRole::Protected
    }
}

/// Login for the archive endpoint. The secret never appears in `Debug` output
/// and is not written when serialized; reading one back leaves it empty.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Where a job's files land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub credentials: Credentials,
    /// Directory on the archive the relative paths are resolved against.
    pub remote_path: String,
}

/// What to do when a file already exists at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    #[default]
    Always,
    Never,
    IfDifferent,
}

/// How a transport decides that a remote file is already complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeCheck {
    None,
    /// Compare sizes.
    #[default]
    FileAttributes,
    /// Compare SHA-256 digests.
    Checksum,
}

/// Transport parameters of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParameters {
    /// Upper bound on throughput; `None` means unthrottled.
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub encryption: bool,
    pub overwrite: OverwritePolicy,
    pub resume_check: ResumeCheck,
    /// Create missing remote directories.
    pub create_path: bool,
    /// Number of concurrent streams for high-throughput transports.
    pub parallel_streams: usize,
}

impl Default for TransferParameters {
    fn default() -> Self {
        Self {
            rate_limit_bytes_per_sec: None,
            encryption: true,
            overwrite: OverwritePolicy::default(),
            resume_check: ResumeCheck::default(),
            create_path: true,
            parallel_streams: 4,
        }
    }
}

/// Immutable description of one batch transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    job_id: JobId,
    submission_id: String,
    transport: TransportKind,
    destination: Destination,
    files: Vec<FileTransferUnit>,
    parameters: TransferParameters,
}

impl TransferJob {
    /// Builds a job from a manifest, validating it first.
    pub fn new(
        submission_id: impl Into<String>,
        transport: TransportKind,
        destination: Destination,
        files: Vec<FileTransferUnit>,
        parameters: TransferParameters,
    ) -> Result<Self, ManifestError> {
        let submission_id = submission_id.into();
        if submission_id.trim().is_empty() {
            return Err(ManifestError::EmptySubmissionId);
        }

        validate_remote_root(&destination.remote_path)?;
        let mut seen = HashSet::with_capacity(files.len());
        for unit in &files {
            validate_unit_path(&unit.remote_relative_path)?;
            if !seen.insert(unit.id()) {
                return Err(ManifestError::DuplicateUnit(unit.id().to_string()));
            }
        }

        let protected = files.iter().filter(|u| u.is_protected()).count();
        if protected > 1 {
            return Err(ManifestError::MultipleProtected(protected));
        }

        Ok(Self {
            job_id: JobId::new(),
            submission_id,
            transport,
            destination,
            files,
            parameters,
        })
    }

    /// Returns a copy of this job, with the same id, that only carries the
    /// units accepted by `keep`.
    pub fn reduced(&self, keep: impl Fn(&FileTransferUnit) -> bool) -> Self {
        Self {
            job_id: self.job_id.clone(),
            submission_id: self.submission_id.clone(),
            transport: self.transport,
            destination: self.destination.clone(),
            files: self.files.iter().filter(|u| keep(u)).cloned().collect(),
            parameters: self.parameters.clone(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn files(&self) -> &[FileTransferUnit] {
        &self.files
    }

    pub fn parameters(&self) -> &TransferParameters {
        &self.parameters
    }

    /// Sum of the manifest's declared sizes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|u| u.size_bytes).sum()
    }

    /// The protected unit, if the manifest carries one.
    pub fn protected_unit(&self) -> Option<&FileTransferUnit> {
        self.files.iter().find(|u| u.is_protected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination {
            host: "archive.example.org".into(),
            credentials: Credentials {
                username: "submitter".into(),
                secret: "hunter2".into(),
            },
            remote_path: "incoming/sub-001".into(),
        }
    }

    fn unit(path: &str, size: u64) -> FileTransferUnit {
        FileTransferUnit::new(format!("/data/{path}"), path, size)
    }

    #[test]
    fn builds_valid_job() {
        let job = TransferJob::new(
            "sub-001",
            TransportKind::SingleStream,
            destination(),
            vec![unit("a.fastq", 10), unit("b.fastq", 20), unit("md5.txt", 1).protected()],
            TransferParameters::default(),
        )
        .unwrap();

        assert_eq!(job.files().len(), 3);
        assert_eq!(job.total_bytes(), 31);
        assert_eq!(job.protected_unit().unwrap().id(), "md5.txt");
    }

    #[test]
    fn rejects_duplicate_units() {
        let err = TransferJob::new(
            "sub-001",
            TransportKind::SingleStream,
            destination(),
            vec![unit("a.fastq", 10), unit("a.fastq", 10)],
            TransferParameters::default(),
        )
        .unwrap_err();
        assert_eq!(err, ManifestError::DuplicateUnit("a.fastq".into()));
    }

    #[test]
    fn rejects_two_protected_units() {
        let err = TransferJob::new(
            "sub-001",
            TransportKind::HighThroughput,
            destination(),
            vec![unit("x", 1).protected(), unit("y", 1).protected()],
            TransferParameters::default(),
        )
        .unwrap_err();
        assert_eq!(err, ManifestError::MultipleProtected(2));
    }

    #[test]
    fn rejects_blank_submission_and_bad_paths() {
        assert_eq!(
            TransferJob::new(
                "  ",
                TransportKind::SingleStream,
                destination(),
                vec![],
                TransferParameters::default()
            )
            .unwrap_err(),
            ManifestError::EmptySubmissionId
        );
        assert!(matches!(
            TransferJob::new(
                "sub-001",
                TransportKind::SingleStream,
                destination(),
                vec![unit("../etc/passwd", 1)],
                TransferParameters::default()
            ),
            Err(ManifestError::InvalidUnitPath { .. })
        ));
        let mut outside = destination();
        outside.remote_path = "/srv/archive".into();
        assert!(matches!(
            TransferJob::new(
                "sub-001",
                TransportKind::SingleStream,
                outside,
                vec![unit("a", 1)],
                TransferParameters::default()
            ),
            Err(ManifestError::InvalidRemoteRoot { .. })
        ));
    }

    #[test]
    fn reduced_keeps_job_id_and_order() {
        let job = TransferJob::new(
            "sub-001",
            TransportKind::SingleStream,
            destination(),
            vec![unit("a", 1), unit("b", 2), unit("c", 3)],
            TransferParameters::default(),
        )
        .unwrap();

        let reduced = job.reduced(|u| u.id() != "b");
        assert_eq!(reduced.job_id(), job.job_id());
        let ids: Vec<_> = reduced.files().iter().map(|u| u.id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let dbg = format!("{:?}", destination());
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("submitter"));
    }

    #[test]
    fn serialized_destination_reads_back_without_secret() {
        let json = serde_json::to_string(&destination()).unwrap();
        assert!(!json.contains("hunter2"));

        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back.credentials.username, "submitter");
        assert!(back.credentials.secret.is_empty());
        assert_eq!(back.remote_path, "incoming/sub-001");
    }

    #[test]
    fn parameters_fill_defaults() {
        let params: TransferParameters =
            serde_json::from_str(r#"{"overwrite":"if_different"}"#).unwrap();
        assert_eq!(params.overwrite, OverwritePolicy::IfDifferent);
        assert_eq!(params.resume_check, ResumeCheck::FileAttributes);
        assert!(params.create_path);
        assert_eq!(params.parallel_streams, 4);
    }
}
