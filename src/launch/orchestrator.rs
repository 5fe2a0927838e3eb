//! Launch Orchestrator
//!
//! Drives one identity at a time through
//!
//! ```text
//! Idle -> Admission -> Acquiring -> Launching -> Verifying -> Releasing -> Idle
//! ```
//!
//! The episode lock from [`IsolationManager::begin_episode`] is held from
//! admission to release, so no two identities ever overlap between
//! acquisition and release, even across concurrent batches.
//!
//! Failure handling:
//! - Admission and Acquiring failures leave storage untouched (acquisition
//!   rolls itself back) and end the identity's attempt.
//! - Launching and Verifying failures still go through Releasing.
//! - Invariant violations, registry conflicts and failed restores force a
//!   reconciliation pass before the next identity.
//! - Storage operations copy whole trees, so they run on the blocking pool.
//! - Nothing escapes the batch loop; every failure becomes an
//!   [`IdentityOutcome`] and a [`StatusEvent`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Instant};

use crate::launch::collaborator::{
    CredentialSource, LaunchCollaborator, LaunchRequest, LivenessProbe,
};
use crate::launch::error::LaunchError;
use crate::launch::record::{LaunchLog, LaunchRecord};
use crate::launch::retry::{retry_with_backoff, RetryConfig};
use crate::launch::verify::{verify_liveness, Verification, VerifyPolicy};
use crate::storage::{Acquisition, IsolationError, IsolationManager, ReleaseOutcome};

/// Where an identity is in its launch episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStage {
    Idle,
    Admission,
    Acquiring,
    Launching,
    Verifying,
    Releasing,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Admission => "admission",
            Self::Acquiring => "acquiring",
            Self::Launching => "launching",
            Self::Verifying => "verifying",
            Self::Releasing => "releasing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entered,
    Succeeded,
    Warning,
    Failed,
}

/// One human-readable status line
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub identity: String,
    pub stage: LaunchStage,
    pub kind: EventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.kind {
            EventKind::Entered => "..",
            EventKind::Succeeded => "ok",
            EventKind::Warning => "!!",
            EventKind::Failed => "FAILED",
        };
        write!(
            f,
            "[{}] {} {}: {}",
            self.identity, self.stage, marker, self.message
        )
    }
}

/// Timing and limits for a batch
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub verify: VerifyPolicy,
    pub retry: RetryConfig,
    pub launch_timeout: Duration,
    /// How long the isolation stays in place after verification
    pub claim_delay: Duration,
    pub inter_identity_delay: Duration,
    /// Upper bound of the random extra added to `inter_identity_delay`
    pub inter_identity_jitter: Duration,
    /// 0 disables admission control
    pub max_running_processes: usize,
    pub admission_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            verify: VerifyPolicy::default(),
            retry: RetryConfig::default(),
            launch_timeout: Duration::from_secs(60),
            claim_delay: Duration::from_secs(10),
            inter_identity_delay: Duration::from_secs(5),
            inter_identity_jitter: Duration::ZERO,
            max_running_processes: 10,
            admission_timeout: Duration::from_secs(120),
        }
    }
}

/// Result of one identity's episode
#[derive(Debug, Clone, Serialize)]
pub struct IdentityOutcome {
    pub identity: String,
    pub success: bool,
    /// First stage that failed
    pub failed_stage: Option<LaunchStage>,
    pub error: Option<String>,
    pub acquire_attempts: usize,
    pub restored_backup: bool,
    pub record: Option<LaunchRecord>,
}

impl IdentityOutcome {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            success: false,
            failed_stage: None,
            error: None,
            acquire_attempts: 0,
            restored_backup: false,
            record: None,
        }
    }

    fn fail(&mut self, stage: LaunchStage, error: &LaunchError) {
        if self.failed_stage.is_none() {
            self.failed_stage = Some(stage);
            self.error = Some(error.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<IdentityOutcome>,
    /// Stopped before every identity was processed
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

#[derive(Debug, Default)]
struct ControlInner {
    stop: AtomicBool,
    notify: Notify,
}

/// Stops a batch between identities
///
/// The identity in flight always finishes its teardown first.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    inner: Arc<ControlInner>,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

pub struct OrchestratorBuilder {
    storage: Arc<IsolationManager>,
    collaborator: Arc<dyn LaunchCollaborator>,
    probe: Arc<dyn LivenessProbe>,
    credentials: Option<Arc<dyn CredentialSource>>,
    settings: OrchestratorSettings,
    events: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl OrchestratorBuilder {
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Send every status event to `events` as well as the log
    pub fn events(mut self, events: mpsc::UnboundedSender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> LaunchOrchestrator {
        LaunchOrchestrator {
            storage: self.storage,
            collaborator: self.collaborator,
            probe: self.probe,
            credentials: self.credentials,
            settings: self.settings,
            events: self.events,
            log: LaunchLog::new(),
        }
    }
}

pub struct LaunchOrchestrator {
    storage: Arc<IsolationManager>,
    collaborator: Arc<dyn LaunchCollaborator>,
    probe: Arc<dyn LivenessProbe>,
    credentials: Option<Arc<dyn CredentialSource>>,
    settings: OrchestratorSettings,
    events: Option<mpsc::UnboundedSender<StatusEvent>>,
    log: LaunchLog,
}

impl LaunchOrchestrator {
    pub fn builder(
        storage: Arc<IsolationManager>,
        collaborator: Arc<dyn LaunchCollaborator>,
        probe: Arc<dyn LivenessProbe>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            storage,
            collaborator,
            probe,
            credentials: None,
            settings: OrchestratorSettings::default(),
            events: None,
        }
    }

    pub fn storage(&self) -> &Arc<IsolationManager> {
        &self.storage
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn launch_log(&self) -> &LaunchLog {
        &self.log
    }

    /// Forget launch records and tear down any isolation still registered
    pub fn stop_all(&self) -> usize {
        let released = self.storage.release_all();
        let forgotten = self.log.clear();
        tracing::info!(
            "Stopped all: {} isolation(s) released, {} launch record(s) cleared",
            released,
            forgotten
        );
        forgotten
    }

    /// Launch `identities` in order, one at a time
    pub async fn run_batch(
        &self,
        identities: &[String],
        target: &str,
        control: &BatchControl,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        tracing::info!("Starting batch of {} identities", identities.len());

        for (index, identity) in identities.iter().enumerate() {
            if control.is_stopped() {
                report.cancelled = true;
                break;
            }
            if index > 0 && !self.inter_identity_pause(control).await {
                report.cancelled = true;
                break;
            }

            let outcome = self.launch_identity(identity, target).await;
            report.outcomes.push(outcome);
        }

        if report.cancelled {
            tracing::warn!(
                "Batch stopped after {} of {} identities",
                report.outcomes.len(),
                identities.len()
            );
        }
        tracing::info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        report
    }

    /// Settle delay between identities; false if the batch was stopped
    async fn inter_identity_pause(&self, control: &BatchControl) -> bool {
        let jitter = self.settings.inter_identity_jitter.mul_f64(rand::random::<f64>());
        let delay = self.settings.inter_identity_delay + jitter;
        if delay.is_zero() {
            return !control.is_stopped();
        }

        tracing::debug!("Waiting {:?} before next identity", delay);
        tokio::select! {
            _ = sleep(delay) => !control.is_stopped(),
            _ = control.stopped() => false,
        }
    }

    /// Run one identity's full episode
    pub async fn launch_identity(&self, identity: &str, target: &str) -> IdentityOutcome {
        let _episode = self.storage.begin_episode().await;
        let mut outcome = IdentityOutcome::new(identity);

        self.emit(identity, LaunchStage::Admission, EventKind::Entered, "checking process limit");
        if let Err(e) = self.admit(identity).await {
            self.fail_stage(&mut outcome, LaunchStage::Admission, e);
            return outcome;
        }

        let token = match self.token(identity).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_stage(&mut outcome, LaunchStage::Admission, e);
                return outcome;
            }
        };

        self.emit(identity, LaunchStage::Acquiring, EventKind::Entered, "isolating storage");
        let (acquisition, attempts) = self.acquire_with_retry(identity).await;
        outcome.acquire_attempts = attempts;
        let acquisition = match acquisition {
            Ok(acquisition) => acquisition,
            Err(e) => {
                let reconcile = e.requires_reconciliation();
                self.fail_stage(&mut outcome, LaunchStage::Acquiring, LaunchError::Isolation(e));
                if reconcile {
                    self.reconcile(identity).await;
                }
                return outcome;
            }
        };
        self.emit(
            identity,
            LaunchStage::Acquiring,
            EventKind::Succeeded,
            format!("storage -> {}", acquisition.area.content_path.display()),
        );

        let request = LaunchRequest {
            identity: identity.to_string(),
            target: target.to_string(),
            token,
            content_path: acquisition.area.content_path.clone(),
        };
        let launched = self.launch_and_verify(&request, &mut outcome).await;

        if launched && !self.settings.claim_delay.is_zero() {
            tracing::debug!(
                "Holding isolation for {} for {:?}",
                identity,
                self.settings.claim_delay
            );
            sleep(self.settings.claim_delay).await;
        }

        self.release(acquisition, &mut outcome).await;

        outcome.success = outcome.failed_stage.is_none();
        if outcome.success {
            self.emit(identity, LaunchStage::Idle, EventKind::Succeeded, "launch complete");
        }
        outcome
    }

    /// Launching and Verifying; true when the external process was seen live
    async fn launch_and_verify(&self, request: &LaunchRequest, outcome: &mut IdentityOutcome) -> bool {
        let identity = request.identity.as_str();
        let baseline = match self.probe.count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Cannot take baseline process count: {:#}", e);
                0
            }
        };

        self.emit(
            identity,
            LaunchStage::Launching,
            EventKind::Entered,
            format!("starting via {}", self.collaborator.name()),
        );
        let launched_at = Utc::now();
        let handle = match tokio::time::timeout(
            self.settings.launch_timeout,
            self.collaborator.launch(request),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let error = LaunchError::Collaborator {
                    collaborator: self.collaborator.name().to_string(),
                    identity: identity.to_string(),
                    message: format!("{:#}", e),
                };
                self.fail_stage(outcome, LaunchStage::Launching, error);
                return false;
            }
            Err(_) => {
                let error = LaunchError::LaunchTimeout {
                    identity: identity.to_string(),
                    timeout: self.settings.launch_timeout,
                };
                self.fail_stage(outcome, LaunchStage::Launching, error);
                return false;
            }
        };
        self.emit(
            identity,
            LaunchStage::Launching,
            EventKind::Succeeded,
            format!("started ({})", handle.method),
        );

        self.emit(identity, LaunchStage::Verifying, EventKind::Entered, "waiting for process");
        let verification = verify_liveness(
            self.probe.as_ref(),
            self.collaborator.as_ref(),
            request,
            baseline,
            &self.settings.verify,
        )
        .await;

        let record = LaunchRecord {
            identity: identity.to_string(),
            server_target: request.target.clone(),
            launched_at,
            method: handle.method,
            external_handle: handle.external_handle,
            verified: verification.is_live(),
        };
        self.log.record(record.clone());
        outcome.record = Some(record);

        match verification {
            Verification::Live {
                count,
                fallback_used,
                ..
            } => {
                let via = if fallback_used { " after fallback" } else { "" };
                self.emit(
                    identity,
                    LaunchStage::Verifying,
                    EventKind::Succeeded,
                    format!("live{} ({} running)", via, count),
                );
                true
            }
            Verification::TimedOut { elapsed, .. } => {
                let error = LaunchError::NotVerified {
                    identity: identity.to_string(),
                    waited: elapsed,
                };
                self.fail_stage(outcome, LaunchStage::Verifying, error);
                false
            }
        }
    }

    /// Releasing always runs once acquisition succeeded
    async fn release(&self, acquisition: Acquisition, outcome: &mut IdentityOutcome) {
        let identity = acquisition.record.identity.clone();
        self.emit(&identity, LaunchStage::Releasing, EventKind::Entered, "restoring storage");

        let snapshot = acquisition.snapshot;
        let released = on_storage(&self.storage, &identity, {
            let identity = identity.clone();
            move |storage| storage.release(&identity, snapshot)
        })
        .await;
        match released {
            Ok(ReleaseOutcome::Released { restored }) => {
                outcome.restored_backup = restored;
                let message = if restored {
                    "released, original content restored"
                } else {
                    "released"
                };
                self.emit(&identity, LaunchStage::Releasing, EventKind::Succeeded, message);
            }
            Ok(ReleaseOutcome::NothingToRelease) => {
                self.emit(
                    &identity,
                    LaunchStage::Releasing,
                    EventKind::Warning,
                    "nothing to release",
                );
            }
            Err(e) => {
                let reconcile = e.requires_reconciliation();
                self.fail_stage(outcome, LaunchStage::Releasing, LaunchError::Isolation(e));
                let forced = on_storage(&self.storage, &identity, {
                    let identity = identity.clone();
                    move |storage| storage.force_release(&identity)
                })
                .await;
                if let Err(e) = forced {
                    tracing::error!("Forced release of {} failed: {}", identity, e);
                }
                if reconcile {
                    self.reconcile(&identity).await;
                }
            }
        }
    }

    /// Wait while too many external processes are running
    async fn admit(&self, identity: &str) -> Result<usize, LaunchError> {
        let limit = self.settings.max_running_processes;
        let start = Instant::now();

        loop {
            let running = match self.probe.count().await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!("Process count unavailable, admitting {}: {:#}", identity, e);
                    return Ok(0);
                }
            };
            if limit == 0 || running < limit {
                return Ok(running);
            }

            let waited = start.elapsed();
            if waited >= self.settings.admission_timeout {
                return Err(LaunchError::AdmissionTimeout {
                    running,
                    limit,
                    waited,
                });
            }
            self.emit(
                identity,
                LaunchStage::Admission,
                EventKind::Warning,
                format!("{} processes running (limit {}), waiting", running, limit),
            );
            let remaining = self.settings.admission_timeout - waited;
            sleep(self.settings.verify.poll_interval.min(remaining)).await;
        }
    }

    async fn token(&self, identity: &str) -> Result<Option<String>, LaunchError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        credentials
            .token(identity)
            .await
            .map_err(|e| LaunchError::Credentials {
                identity: identity.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Acquire, tearing down leftovers before every attempt
    async fn acquire_with_retry(
        &self,
        identity: &str,
    ) -> (Result<Acquisition, IsolationError>, usize) {
        let mut attempts = 0;
        let result = retry_with_backoff(
            &self.settings.retry,
            |attempt| {
                attempts = attempt + 1;
                let storage = Arc::clone(&self.storage);
                let identity = identity.to_string();
                async move {
                    let name = identity.clone();
                    on_storage(&storage, &identity, move |storage| {
                        match storage.force_release(&name) {
                            Ok(ReleaseOutcome::Released { .. }) => {
                                tracing::warn!("Tore down leftover isolation for {}", name)
                            }
                            Ok(ReleaseOutcome::NothingToRelease) => {}
                            Err(e) => tracing::warn!("Could not tear down {}: {}", name, e),
                        }
                        storage.acquire(&name)
                    })
                    .await
                }
            },
            IsolationError::is_retryable,
        )
        .await;
        (result, attempts)
    }

    async fn reconcile(&self, identity: &str) {
        match on_storage(&self.storage, identity, |storage| storage.reconcile()).await {
            Ok(report) => self.emit(
                identity,
                LaunchStage::Idle,
                EventKind::Warning,
                format!("reconciled storage: {}", report),
            ),
            Err(e) => self.emit(
                identity,
                LaunchStage::Idle,
                EventKind::Failed,
                format!("reconciliation failed: {}", e),
            ),
        }
    }

    fn fail_stage(&self, outcome: &mut IdentityOutcome, stage: LaunchStage, error: LaunchError) {
        self.emit(&outcome.identity, stage, EventKind::Failed, error.to_string());
        outcome.fail(stage, &error);
    }

    fn emit(&self, identity: &str, stage: LaunchStage, kind: EventKind, message: impl Into<String>) {
        let event = StatusEvent {
            identity: identity.to_string(),
            stage,
            kind,
            message: message.into(),
            at: Utc::now(),
        };
        match kind {
            EventKind::Entered => tracing::debug!("{}", event),
            EventKind::Succeeded => tracing::info!("{}", event),
            EventKind::Warning => tracing::warn!("{}", event),
            EventKind::Failed => tracing::error!("{}", event),
        }
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Run `op` against the manager on the blocking pool
async fn on_storage<T, F>(
    storage: &Arc<IsolationManager>,
    identity: &str,
    op: F,
) -> Result<T, IsolationError>
where
    T: Send + 'static,
    F: FnOnce(&IsolationManager) -> Result<T, IsolationError> + Send + 'static,
{
    let storage = Arc::clone(storage);
    match tokio::task::spawn_blocking(move || op(&storage)).await {
        Ok(result) => result,
        Err(e) => Err(IsolationError::Interrupted {
            identity: identity.to_string(),
            message: e.to_string(),
        }),
    }
}
