//! Data model shared by the archive-uplink crates.
//!
//! A [`TransferJob`] describes one batch of files bound for the archive.
//! Transports report what happens to it through [`ProgressEvent`]s, and
//! expose per-session counters as [`SessionStats`].

mod events;
mod job;
mod session;
mod validation;

pub use events::{JobEvent, ProgressEvent};
pub use job::{
    Credentials, Destination, FileTransferUnit, JobId, ManifestError, OverwritePolicy,
    ResumeCheck, TransferJob, TransferParameters, TransportKind, UnitRole,
};
pub use session::{SessionId, SessionState, SessionStats, TransferSessionHandle};
pub use validation::{validate_remote_root, validate_unit_path};
