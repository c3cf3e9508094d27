//! Transport engines and the guard that serializes access to them.
//!
//! A transport engine is a stateful, non-reentrant object that moves a
//! job's bytes to the archive and reports back through listeners called on
//! its own threads. [`EngineGuard`] owns the single engine instance of a
//! process and funnels every call through one lock.
//!
//! Two engines ship with the crate, both delivering into an archive endpoint
//! mounted as a local directory:
//!
//! - [`SingleStreamTransport`]: one file at a time, each confirmed before the
//!   next starts.
//! - [`ParallelStreamTransport`]: several concurrent streams, skipping files
//!   the destination already holds.

mod chunked;
mod deliver;
mod engine;
mod guard;
mod parallel;
mod single_stream;
mod tracker;

pub use chunked::{ChunkReader, Throttle, calculate_file_checksum, checksum_bytes};
pub use engine::{EngineListener, ListenerId, TransportEngine};
pub use guard::{EngineFactory, EngineGuard, EngineRef};
pub use parallel::ParallelStreamTransport;
pub use single_stream::SingleStreamTransport;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by a transport engine call.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] uplink_protocol::ManifestError),

    #[error("engine busy with session {0}")]
    Busy(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unsupported job: {0}")]
    Unsupported(String),

    #[error("session start rejected: {0}")]
    Rejected(String),
}

/// The transport engine could not be constructed.
///
/// Cloneable so the guard can hand the same failure to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport engine initialization failed: {0}")]
pub struct EngineInitError(pub String);

impl EngineInitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
