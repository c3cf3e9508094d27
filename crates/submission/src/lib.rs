//! Submission upload flow.
//!
//! Moves the files of a data submission to the archive through a
//! [`uplink_transport::TransportEngine`], surviving restarts and flaky
//! session starts.
//!
//! # Pipeline
//!
//! 1. **Resume**: load the submission's record and drop confirmed units
//! 2. **Start**: open a session, retrying failed starts a bounded number of times
//! 3. **Track**: fan engine events out on the [`ProgressBus`] and record
//!    every confirmed unit
//! 4. **Validate**: check the engine's counters against the manifest

pub mod bus;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod starter;
pub mod state;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{ProgressBus, ProgressSubscriber, SubscriptionId};
pub use config::{ConfigError, UplinkConfig, default_config_path};
pub use error::{PersistenceError, StartError, SubmitError, ValidationError};
pub use orchestrator::SessionOrchestrator;
pub use starter::{RetryPolicy, RetryingSessionStarter};
pub use state::{SubmissionRecord, SubmissionState, SubmissionStore};
pub use types::{AttemptState, FailureKind, TransferOutcome};
pub use validator::{SessionValidator, Validated};
