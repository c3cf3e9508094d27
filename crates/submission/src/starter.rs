//! Bounded retry of transport session starts.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uplink_protocol::{TransferJob, TransferSessionHandle};
use uplink_transport::EngineGuard;

use crate::error::StartError;

/// Default number of start attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed wait between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How session starts are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Starts transport sessions through an [`EngineGuard`], retrying failed
/// starts with a fixed, cancellable delay.
pub struct RetryingSessionStarter {
    guard: Arc<EngineGuard>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingSessionStarter {
    pub fn new(guard: Arc<EngineGuard>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            guard,
            policy,
            cancel,
        }
    }

    /// Starts a session for `job`.
    ///
    /// Makes at most `max_retries` attempts and sleeps between them. An
    /// engine that cannot be constructed is reported at once.
    pub async fn start(&self, job: &TransferJob) -> Result<TransferSessionHandle, StartError> {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StartError::Cancelled);
            }
            attempt += 1;

            let err = match self.guard.with_lock(|engine| engine.start_session(job))? {
                Ok(session_id) => {
                    info!(
                        job = %job.job_id(),
                        session = %session_id,
                        attempt,
                        "transfer session started"
                    );
                    return Ok(TransferSessionHandle::new(session_id, job.job_id().clone()));
                }
                Err(e) => e,
            };

            warn!(
                job = %job.job_id(),
                attempt,
                max_attempts,
                error = %err,
                "session start failed"
            );
            if attempt >= max_attempts {
                return Err(StartError::Exhausted {
                    attempts: attempt,
                    last_cause: err.to_string(),
                });
            }

            debug!(delay = ?self.policy.retry_delay, "waiting before next start attempt");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(job = %job.job_id(), "start retry cancelled");
                    return Err(StartError::Cancelled);
                }
                _ = tokio::time::sleep(self.policy.retry_delay) => {}
            }
        }
    }
}
