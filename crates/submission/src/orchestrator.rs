//! Submission orchestrator.
//!
//! Runs one attempt of a submission: skips units an earlier attempt already
//! confirmed, starts a session with bounded retry, records every confirmed
//! unit as it arrives and only reports success once the session passed
//! validation.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uplink_protocol::{JobEvent, JobId, ProgressEvent, TransferJob, TransferSessionHandle};
use uplink_transport::{EngineGuard, EngineListener, ListenerId};

use crate::bus::{ProgressBus, SubscriptionId};
use crate::config::UplinkConfig;
use crate::error::{PersistenceError, StartError, SubmitError, ValidationError};
use crate::starter::{RetryPolicy, RetryingSessionStarter};
use crate::state::{SubmissionRecord, SubmissionStore};
use crate::types::{AttemptState, FailureKind, TransferOutcome};
use crate::validator::SessionValidator;

/// Orchestrates submission attempts against one transport engine.
///
/// Attempts sharing an orchestrator (or its [`EngineGuard`]) run one at a
/// time. Each attempt has its own cancellation token, a child of the
/// orchestrator's root token.
pub struct SessionOrchestrator {
    guard: Arc<EngineGuard>,
    store: SubmissionStore,
    bus: ProgressBus,
    policy: RetryPolicy,
    root_cancel: Mutex<CancellationToken>,
    state_tx: watch::Sender<AttemptState>,
}

/// Engine listener and bus subscription of one attempt. Both are released
/// on drop.
struct Attachment<'a> {
    guard: &'a EngineGuard,
    bus: &'a ProgressBus,
    subscription: SubscriptionId,
    listener: Option<ListenerId>,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            match self.guard.with_lock(|engine| engine.remove_listener(id)) {
                Ok(true) => trace!("engine listener removed"),
                Ok(false) => debug!("engine listener was already gone"),
                Err(e) => debug!(error = %e, "engine unavailable while removing listener"),
            }
        }
        self.bus.unsubscribe(self.subscription);
    }
}

/// How the event stream of a session ended.
struct Tracked {
    cancel_requested: bool,
    write_error: Option<PersistenceError>,
}

impl SessionOrchestrator {
    /// Must be called from within a Tokio runtime (the progress bus spawns
    /// its dispatcher).
    pub fn new(guard: Arc<EngineGuard>, store: SubmissionStore, policy: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(AttemptState::Idle);
        Self {
            guard,
            store,
            bus: ProgressBus::new(),
            policy,
            root_cancel: Mutex::new(CancellationToken::new()),
            state_tx,
        }
    }

    pub fn from_config(guard: Arc<EngineGuard>, config: &UplinkConfig) -> Self {
        Self::new(
            guard,
            SubmissionStore::new(config.state_dir.clone()),
            config.retry_policy(),
        )
    }

    /// Publishes on `bus` instead of a private one.
    pub fn with_bus(mut self, bus: ProgressBus) -> Self {
        self.bus = bus;
        self
    }

    /// The bus carrying every [`JobEvent`] of every attempt.
    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn store(&self) -> &SubmissionStore {
        &self.store
    }

    /// A fresh token for one attempt. [`cancel_all`](Self::cancel_all) also
    /// cancels it.
    pub fn attempt_token(&self) -> CancellationToken {
        self.root_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Cancels every attempt in flight. Later attempts are unaffected.
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(
            &mut *self.root_cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        info!("cancelling every attempt in flight");
        previous.cancel();
    }

    /// Watches the state of the current attempt.
    pub fn state(&self) -> watch::Receiver<AttemptState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, job_id: &JobId, state: AttemptState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(job = %job_id, from = ?previous, to = ?state, "attempt state changed");
        }
    }

    /// Runs an attempt on a new task. The returned token cancels that
    /// attempt only.
    pub fn spawn_submit(
        self: &Arc<Self>,
        job: TransferJob,
    ) -> (CancellationToken, JoinHandle<TransferOutcome>) {
        let cancel = self.attempt_token();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.submit_with_cancel(job, token).await });
        (cancel, task)
    }

    /// Uploads the units of `job` not yet confirmed for its submission.
    pub async fn submit(&self, job: TransferJob) -> TransferOutcome {
        let cancel = self.attempt_token();
        self.submit_with_cancel(job, cancel).await
    }

    /// Like [`submit`](Self::submit), stopping early once `cancel` fires.
    pub async fn submit_with_cancel(
        &self,
        job: TransferJob,
        cancel: CancellationToken,
    ) -> TransferOutcome {
        let job_id = job.job_id().clone();
        self.set_state(&job_id, AttemptState::Idle);
        info!(
            job = %job_id,
            submission = job.submission_id(),
            files = job.files().len(),
            "submission attempt started"
        );

        let mut record = None;
        match self.run(&job, &cancel, &mut record).await {
            Ok(outcome) => {
                self.set_state(&job_id, AttemptState::Succeeded);
                outcome
            }
            Err(e) => {
                self.set_state(&job_id, AttemptState::Failed);
                let kind = FailureKind::from(&e);
                let outstanding: Vec<String> = job
                    .files()
                    .iter()
                    .filter(|u| !record.as_ref().is_some_and(|r| r.is_uploaded(u)))
                    .map(|u| u.id().to_string())
                    .collect();
                error!(
                    job = %job_id,
                    kind = ?kind,
                    outstanding = outstanding.len(),
                    error = %e,
                    "submission attempt failed"
                );
                TransferOutcome::Failure {
                    job_id,
                    kind,
                    detail: e.to_string(),
                    outstanding,
                }
            }
        }
    }

    async fn run(
        &self,
        job: &TransferJob,
        cancel: &CancellationToken,
        slot: &mut Option<SubmissionRecord>,
    ) -> Result<TransferOutcome, SubmitError> {
        if cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }
        // Load the record only once the slot is held.
        let _session_slot = tokio::select! {
            _ = cancel.cancelled() => return Err(SubmitError::Cancelled),
            held = self.guard.claim_session_slot() => held,
        };
        let record = slot.insert(self.store.open(job.submission_id())?);

        let missing = record.missing_protected(job);
        if !missing.is_empty() {
            return Err(SubmitError::ProtectedUnitMissing(missing));
        }
        if let Some(unit) = job.protected_unit() {
            record.require_protected([unit.id()])?;
        }

        let pending = job.reduced(|u| !record.is_uploaded(u));
        if pending.files().is_empty() {
            info!(job = %job.job_id(), "every unit already confirmed");
            return Ok(TransferOutcome::AlreadyComplete {
                job_id: job.job_id().clone(),
            });
        }
        if pending.files().len() < job.files().len() {
            info!(
                job = %job.job_id(),
                confirmed = job.files().len() - pending.files().len(),
                pending = pending.files().len(),
                "resuming submission"
            );
        }

        let (subscription, mut events) = self.bus.subscribe_channel();
        let mut attachment = Attachment {
            guard: &self.guard,
            bus: &self.bus,
            subscription,
            listener: None,
        };
        let listener = self.forwarding_listener(pending.job_id().clone());
        attachment.listener = Some(
            self.guard
                .with_lock(|engine| engine.add_listener(listener))
                .map_err(StartError::from)?,
        );

        self.set_state(job.job_id(), AttemptState::Starting);
        let starter = RetryingSessionStarter::new(
            Arc::clone(&self.guard),
            self.policy.clone(),
            cancel.clone(),
        );
        let handle = starter.start(&pending).await?;

        self.set_state(job.job_id(), AttemptState::Transferring);
        let tracked = self.track(&handle, cancel, &mut events, record).await?;
        drop(attachment);

        if let Some(e) = tracked.write_error {
            return Err(e.into());
        }

        self.set_state(job.job_id(), AttemptState::Validating);
        let validator = SessionValidator::new(Arc::clone(&self.guard));
        let validated = match validator.validate(&pending, &handle) {
            Ok(v) => v,
            Err(_) if tracked.cancel_requested => return Err(SubmitError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        let unconfirmed = pending.files().iter().filter(|u| !record.is_uploaded(u)).count();
        if unconfirmed > 0 {
            warn!(
                job = %job.job_id(),
                unconfirmed,
                "engine counted files it never confirmed"
            );
            return Err(ValidationError::IncompleteTransfer {
                completed: pending.files().len() - unconfirmed,
                expected: pending.files().len(),
            }
            .into());
        }

        Ok(TransferOutcome::Success {
            job_id: job.job_id().clone(),
            files_transferred: validated.files_complete,
            bytes_transferred: validated.bytes_complete,
        })
    }

    /// Engine listener that republishes every event of every session on the
    /// bus, tagged with `job_id`.
    fn forwarding_listener(&self, job_id: JobId) -> EngineListener {
        let bus = self.bus.clone();
        Arc::new(move |session_id, event| {
            bus.publish(JobEvent {
                job_id: job_id.clone(),
                session_id: session_id.clone(),
                event: event.clone(),
            });
        })
    }

    /// Consumes bus events for `handle`'s session until its terminal event,
    /// recording each confirmed unit in arrival order.
    async fn track(
        &self,
        handle: &TransferSessionHandle,
        cancel: &CancellationToken,
        events: &mut mpsc::UnboundedReceiver<JobEvent>,
        record: &mut SubmissionRecord,
    ) -> Result<Tracked, SubmitError> {
        let mut tracked = Tracked {
            cancel_requested: false,
            write_error: None,
        };
        let mut cancel_forwarded = false;

        loop {
            let next = if cancel_forwarded {
                events.recv().await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracked.cancel_requested = true;
                        cancel_forwarded = true;
                        self.forward_cancel(handle);
                        continue;
                    }
                    next = events.recv() => next,
                }
            };
            let Some(job_event) = next else {
                return Err(SubmitError::EventStreamClosed);
            };
            if job_event.session_id != handle.session_id {
                trace!(session = %job_event.session_id, "ignoring event of another session");
                continue;
            }

            match job_event.event {
                ProgressEvent::Progress {
                    bytes_transferred,
                    bytes_total,
                    ..
                } => trace!(bytes_transferred, bytes_total, "progress"),
                ProgressEvent::FileSuccess { unit } => {
                    if tracked.write_error.is_some() {
                        continue;
                    }
                    if let Err(e) = record.mark_uploaded(&unit) {
                        error!(file = unit.id(), error = %e, "could not record confirmed file");
                        tracked.write_error = Some(e);
                        if !cancel_forwarded {
                            cancel_forwarded = true;
                            self.forward_cancel(handle);
                        }
                    }
                }
                ProgressEvent::FileError { unit, message } => {
                    warn!(file = unit.id(), error = %message, "file transfer failed");
                }
                ProgressEvent::Cancelled { unit } => {
                    debug!(file = unit.id(), "file cancelled");
                }
                ProgressEvent::SessionFailed { reason } => {
                    warn!(session = %handle.session_id, reason = %reason, "session failed");
                    return Ok(tracked);
                }
                ProgressEvent::SessionSucceeded => {
                    info!(session = %handle.session_id, "session reported success");
                    return Ok(tracked);
                }
            }
        }
    }

    fn forward_cancel(&self, handle: &TransferSessionHandle) {
        info!(session = %handle.session_id, "forwarding cancel to engine");
        match self
            .guard
            .with_lock(|engine| engine.cancel_session(&handle.session_id))
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "engine rejected cancel"),
            Err(e) => warn!(error = %e, "engine unavailable for cancel"),
        }
    }

    /// Deletes the state of a submission whose every unit is confirmed.
    pub fn complete_submission(&self, job: &TransferJob) -> Result<(), SubmitError> {
        let Some(record) = self.store.load(job.submission_id())? else {
            return Ok(());
        };
        let confirmed = job.files().iter().filter(|u| record.is_uploaded(u)).count();
        if confirmed < job.files().len() {
            return Err(ValidationError::IncompleteTransfer {
                completed: confirmed,
                expected: job.files().len(),
            }
            .into());
        }
        self.store.delete(job.submission_id())?;
        info!(submission = job.submission_id(), "submission complete");
        Ok(())
    }

    /// Forgets everything recorded for a submission; the next attempt
    /// starts from scratch.
    pub fn reset_submission(&self, submission_id: &str) -> Result<bool, PersistenceError> {
        let removed = self.store.delete(submission_id)?;
        if removed {
            warn!(submission = submission_id, "submission state reset");
        }
        Ok(removed)
    }
}
