//! Delivery of one file into the mounted archive endpoint.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;
use uplink_protocol::{
    FileTransferUnit, OverwritePolicy, ResumeCheck, TransferJob, validate_remote_root,
    validate_unit_path,
};

use crate::chunked::{ChunkReader, Throttle, calculate_file_checksum};
use crate::tracker::SessionTracker;

/// Suffix of files still being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// How a unit ended up at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Copied,
    /// The destination already held an identical file.
    Skipped,
}

#[derive(Debug)]
pub(crate) enum DeliveryError {
    Cancelled,
    Failed(String),
}

impl From<std::io::Error> for DeliveryError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Everything a worker needs to deliver units of one session.
pub(crate) struct DeliveryContext<'a> {
    pub(crate) root: &'a Path,
    pub(crate) job: &'a TransferJob,
    pub(crate) tracker: &'a SessionTracker,
    pub(crate) throttle: &'a Throttle,
    /// Apply the job's resume check to files already at the destination.
    pub(crate) resume: bool,
    pub(crate) chunk_size: usize,
}

impl DeliveryContext<'_> {
    /// Resolves the destination path of a unit below the archive root.
    pub(crate) fn target_path(&self, unit: &FileTransferUnit) -> Result<PathBuf, DeliveryError> {
        let remote_root = &self.job.destination().remote_path;
        validate_remote_root(remote_root).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        validate_unit_path(&unit.remote_relative_path)
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;
        let mut target = self.root.to_path_buf();
        if !remote_root.is_empty() {
            target.push(remote_root);
        }
        target.push(&unit.remote_relative_path);
        Ok(target)
    }

    /// Copies `unit` to the archive, calling `on_chunk` after every chunk.
    pub(crate) fn deliver(
        &self,
        unit: &FileTransferUnit,
        mut on_chunk: impl FnMut(),
    ) -> Result<Delivery, DeliveryError> {
        let target = self.target_path(unit)?;
        let params = self.job.parameters();

        if let Some(parent) = target.parent()
            && !parent.is_dir()
        {
            if !params.create_path {
                return Err(DeliveryError::Failed(format!(
                    "remote directory does not exist: {}",
                    parent.display()
                )));
            }
            std::fs::create_dir_all(parent)?;
        }

        if target.exists() {
            if self.resume && matches_remote(unit, &target, params.resume_check)? {
                debug!(file = %unit.id(), "resume check matched, skipping");
                return Ok(Delivery::Skipped);
            }
            match params.overwrite {
                OverwritePolicy::Always => {}
                OverwritePolicy::Never => {
                    return Err(DeliveryError::Failed(format!(
                        "remote file exists: {}",
                        unit.id()
                    )));
                }
                OverwritePolicy::IfDifferent => {
                    if matches_remote(unit, &target, ResumeCheck::Checksum)? {
                        return Ok(Delivery::Skipped);
                    }
                }
            }
        }

        let partial = partial_path(&target);
        let copied = self.copy(unit, &partial, &mut on_chunk);
        if copied.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        copied?;

        std::fs::rename(&partial, &target)?;
        Ok(Delivery::Copied)
    }

    fn copy(
        &self,
        unit: &FileTransferUnit,
        partial: &Path,
        on_chunk: &mut impl FnMut(),
    ) -> Result<(), DeliveryError> {
        let mut reader = ChunkReader::new(&unit.local_path, self.chunk_size)?;
        if reader.file_size() != unit.size_bytes {
            return Err(DeliveryError::Failed(format!(
                "size mismatch for {}: manifest says {} bytes, file has {}",
                unit.id(),
                unit.size_bytes,
                reader.file_size()
            )));
        }

        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(partial)?;

        while let Some(chunk) = reader.next_chunk()? {
            if self.tracker.cancel_requested() {
                return Err(DeliveryError::Cancelled);
            }
            out.write_all(&chunk)?;
            let n = chunk.len() as u64;
            self.tracker.add_bytes(n);
            self.throttle.pace(n);
            on_chunk();
        }
        out.sync_all()?;
        drop(out);

        let written = std::fs::metadata(partial)?.len();
        if written != unit.size_bytes {
            return Err(DeliveryError::Failed(format!(
                "short write for {}: {written} of {} bytes",
                unit.id(),
                unit.size_bytes
            )));
        }
        if let Some(expected) = &unit.checksum {
            let actual = calculate_file_checksum(partial)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DeliveryError::Failed(format!(
                    "checksum mismatch for {}",
                    unit.id()
                )));
            }
        }
        Ok(())
    }
}

/// Decides whether the remote copy at `target` already matches `unit`.
fn matches_remote(
    unit: &FileTransferUnit,
    target: &Path,
    check: ResumeCheck,
) -> Result<bool, DeliveryError> {
    let size = std::fs::metadata(target)?.len();
    match check {
        ResumeCheck::None => Ok(false),
        ResumeCheck::FileAttributes => Ok(size == unit.size_bytes),
        ResumeCheck::Checksum => {
            if size != unit.size_bytes {
                return Ok(false);
            }
            let expected = match &unit.checksum {
                Some(c) => c.clone(),
                None => calculate_file_checksum(&unit.local_path)?,
            };
            Ok(calculate_file_checksum(target)?.eq_ignore_ascii_case(&expected))
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum_bytes;
    use tempfile::TempDir;
    use uplink_protocol::{Credentials, Destination, TransferParameters, TransportKind};

    struct Fixture {
        _src: TempDir,
        archive: TempDir,
        unit: FileTransferUnit,
    }

    fn fixture(data: &[u8]) -> Fixture {
        let src = TempDir::new().unwrap();
        let local = src.path().join("reads.fastq");
        std::fs::write(&local, data).unwrap();
        Fixture {
            _src: src,
            archive: TempDir::new().unwrap(),
            unit: FileTransferUnit::new(local, "run1/reads.fastq", data.len() as u64),
        }
    }

    fn job(unit: &FileTransferUnit, params: TransferParameters) -> TransferJob {
        TransferJob::new(
            "sub-1",
            TransportKind::SingleStream,
            Destination {
                host: "localhost".into(),
                credentials: Credentials {
                    username: "u".into(),
                    secret: "s".into(),
                },
                remote_path: "incoming".into(),
            },
            vec![unit.clone()],
            params,
        )
        .unwrap()
    }

    fn run(
        f: &Fixture,
        params: TransferParameters,
        resume: bool,
    ) -> Result<Delivery, DeliveryError> {
        let job = job(&f.unit, params);
        let tracker = SessionTracker::new(1, f.unit.size_bytes);
        let throttle = Throttle::new(None);
        let ctx = DeliveryContext {
            root: f.archive.path(),
            job: &job,
            tracker: &tracker,
            throttle: &throttle,
            resume,
            chunk_size: 4,
        };
        ctx.deliver(&f.unit, || {})
    }

    fn remote(f: &Fixture) -> PathBuf {
        f.archive.path().join("incoming/run1/reads.fastq")
    }

    #[test]
    fn copies_into_remote_root() {
        let f = fixture(b"@r1\nACGT\n+\nIIII\n");
        assert_eq!(run(&f, TransferParameters::default(), false).unwrap(), Delivery::Copied);
        assert_eq!(std::fs::read(remote(&f)).unwrap(), b"@r1\nACGT\n+\nIIII\n");
        assert!(!partial_path(&remote(&f)).exists());
    }

    #[test]
    fn missing_directory_without_create_path_fails() {
        let f = fixture(b"data");
        let params = TransferParameters {
            create_path: false,
            ..TransferParameters::default()
        };
        assert!(matches!(
            run(&f, params, false),
            Err(DeliveryError::Failed(msg)) if msg.contains("does not exist")
        ));
    }

    #[test]
    fn checksum_mismatch_leaves_nothing_behind() {
        let mut f = fixture(b"data");
        f.unit.checksum = Some(checksum_bytes(b"other"));
        assert!(matches!(
            run(&f, TransferParameters::default(), false),
            Err(DeliveryError::Failed(msg)) if msg.contains("checksum")
        ));
        assert!(!remote(&f).exists());
        assert!(!partial_path(&remote(&f)).exists());
    }

    #[test]
    fn declared_size_must_match() {
        let mut f = fixture(b"data");
        f.unit.size_bytes = 99;
        assert!(matches!(
            run(&f, TransferParameters::default(), false),
            Err(DeliveryError::Failed(msg)) if msg.contains("size mismatch")
        ));
    }

    #[test]
    fn resume_skips_matching_remote() {
        let f = fixture(b"data");
        std::fs::create_dir_all(remote(&f).parent().unwrap()).unwrap();
        std::fs::write(remote(&f), b"data").unwrap();
        let params = TransferParameters {
            resume_check: ResumeCheck::Checksum,
            ..TransferParameters::default()
        };
        assert_eq!(run(&f, params, true).unwrap(), Delivery::Skipped);
    }

    #[test]
    fn never_overwrite_rejects_existing() {
        let f = fixture(b"data");
        std::fs::create_dir_all(remote(&f).parent().unwrap()).unwrap();
        std::fs::write(remote(&f), b"old!").unwrap();
        let params = TransferParameters {
            overwrite: OverwritePolicy::Never,
            ..TransferParameters::default()
        };
        assert!(run(&f, params, false).is_err());
        assert_eq!(std::fs::read(remote(&f)).unwrap(), b"old!");
    }

    #[test]
    fn cancel_request_stops_copy() {
        let f = fixture(b"0123456789");
        let job = job(&f.unit, TransferParameters::default());
        let tracker = SessionTracker::new(1, 10);
        tracker.request_cancel();
        let throttle = Throttle::new(None);
        let ctx = DeliveryContext {
            root: f.archive.path(),
            job: &job,
            tracker: &tracker,
            throttle: &throttle,
            resume: false,
            chunk_size: 4,
        };
        assert!(matches!(ctx.deliver(&f.unit, || {}), Err(DeliveryError::Cancelled)));
        assert!(!remote(&f).exists());
    }
}
