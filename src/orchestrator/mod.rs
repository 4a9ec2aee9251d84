//! Backup orchestration
//!
//! Turns submitted jobs into lock-scoped, retried, audited engine
//! invocations, and runs the retention sweep that applies evaluator
//! decisions through engine forget calls.
//!
//! Flow for one job: validate -> take a worker slot -> acquire the
//! repository lock -> attempt loop with backoff -> record snapshot +
//! audit entries (still under the lock) -> release -> optional
//! verification. A job never leaves `run` in a non-terminal state, and
//! the lock is released on every path.

pub mod job;
pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditError, AuditLog, AuditRecord};
use crate::engine::{BackupEngine, BackupTarget, EngineError, Repository};
use crate::lock::{AcquireMode, LockError, LockManager, LockToken};
use crate::observability::Metrics;
use crate::retention::{PolicyError, RetentionPolicy, evaluate};
use crate::snapshots::{Snapshot, SnapshotStore, StoreError};
use crate::verify::VerificationService;

pub use job::{BackupJob, JobResult, JobStatus};
pub use retry::{FailureDisposition, RetryPolicy, RetrySchedule, RetryState};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("repository lock unavailable: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("snapshot store failure: {0}")]
    Store(#[from] StoreError),

    #[error("job task was aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Everything the orchestrator needs to know up front. Repositories,
/// targets and policies are resolved once at configuration time.
pub struct OrchestratorSettings {
    pub repositories: Vec<Repository>,
    pub targets: Vec<BackupTarget>,
    pub policies: Vec<RetentionPolicy>,
    pub retry: RetryPolicy,
    pub protect_tag: String,
    pub lock_ttl: std::time::Duration,
    pub max_concurrent_jobs: usize,
    pub verify_after_backup: bool,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub repository_id: String,
    pub kept: usize,
    pub pruned: Vec<String>,
}

/// Handle to a submitted job running on its own task.
pub struct JobHandle {
    pub job_id: Uuid,
    handle: JoinHandle<Result<JobResult>>,
}

impl JobHandle {
    pub async fn join(self) -> Result<JobResult> {
        self.handle.await.map_err(|_| OrchestratorError::Aborted)?
    }
}

pub struct Orchestrator {
    engine: Arc<dyn BackupEngine>,
    store: SnapshotStore,
    audit: Arc<AuditLog>,
    locks: Arc<LockManager>,
    metrics: Arc<Metrics>,
    verifier: Option<Arc<VerificationService>>,
    repositories: HashMap<String, Repository>,
    targets: HashMap<String, BackupTarget>,
    policies: HashMap<String, RetentionPolicy>,
    retry: RetryPolicy,
    protect_tag: String,
    lock_ttl: chrono::Duration,
    verify_after_backup: bool,
    job_slots: Arc<Semaphore>,
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn BackupEngine>,
        store: SnapshotStore,
        audit: Arc<AuditLog>,
        locks: Arc<LockManager>,
        metrics: Arc<Metrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        let lock_ttl = chrono::Duration::from_std(settings.lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));

        Self {
            engine,
            store,
            audit,
            locks,
            metrics,
            verifier: None,
            repositories: settings
                .repositories
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            targets: settings
                .targets
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            policies: settings
                .policies
                .into_iter()
                .map(|p| (p.repository_id.clone(), p))
                .collect(),
            retry: settings.retry,
            protect_tag: settings.protect_tag,
            lock_ttl,
            verify_after_backup: settings.verify_after_backup,
            job_slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a verification service to run after completed backups.
    pub fn with_verifier(mut self, verifier: Arc<VerificationService>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Spawn the job onto its own task and return a handle to it.
    pub fn submit(self: &Arc<Self>, job: BackupJob, mode: AcquireMode) -> JobHandle {
        let job_id = job.id;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(job, mode).await });
        JobHandle { job_id, handle }
    }

    /// Request cooperative cancellation. The flag is observed between retry
    /// attempts; an in-flight engine call finishes undisturbed and only the
    /// next attempt is skipped. Returns false for unknown/finished jobs.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let flags = self.lock_cancel_flags();
        match flags.get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(%job_id, "Job cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Drive one job to a terminal state.
    ///
    /// Invalid jobs fail immediately and are never retried. Audit
    /// persistence failure is fatal to the job even when the engine call
    /// succeeded.
    pub async fn run(&self, job: BackupJob, mode: AcquireMode) -> Result<JobResult> {
        let job_id = job.id;
        let (repo, targets) = self.validate(&job)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.lock_cancel_flags().insert(job_id, cancel.clone());

        let result = self.run_inner(job, repo, targets, mode, cancel).await;
        self.lock_cancel_flags().remove(&job_id);
        result
    }

    async fn run_inner(
        &self,
        mut job: BackupJob,
        repo: Repository,
        targets: Vec<BackupTarget>,
        mode: AcquireMode,
        cancel: Arc<AtomicBool>,
    ) -> Result<JobResult> {
        // Global ceiling on concurrent engine invocations, independent of
        // how many repositories are involved.
        let _permit = self
            .job_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::Aborted)?;

        let token = self
            .locks
            .acquire(&job.repository_id, job.id, self.lock_ttl, mode, &self.audit)
            .await?;
        let renewal = self.spawn_lock_renewal(&token);

        job.status = JobStatus::Running;
        job.start_time = Some(Utc::now());

        let outcome = self.attempt_loop(&mut job, &repo, &targets, &cancel).await;

        job.end_time = Some(Utc::now());
        renewal.abort();
        if let Err(e) = self.locks.release(token) {
            warn!(repository_id = %repo.id, error = %e, "Failed to release repository lock");
        }

        let snapshot_id = outcome?;

        if job.status == JobStatus::Completed && self.verify_after_backup {
            if let (Some(verifier), Some(id)) = (&self.verifier, &snapshot_id) {
                if let Some(snapshot) = self.store.get(&repo.id, id)? {
                    let report = verifier.verify(&snapshot, &repo).await?;
                    if !report.success {
                        warn!(snapshot_id = %id, "Post-backup verification failed");
                    }
                }
            }
        }

        Ok(JobResult { job, snapshot_id })
    }

    /// The retry loop. Runs entirely under the repository lock; snapshot
    /// store updates and audit entries for the job happen here so a
    /// concurrent retention sweep can never interleave with them.
    async fn attempt_loop(
        &self,
        job: &mut BackupJob,
        repo: &Repository,
        targets: &[BackupTarget],
        cancel: &AtomicBool,
    ) -> Result<Option<String>> {
        let mut schedule = RetrySchedule::new(self.retry.clone());
        let actor = format!("job:{}", job.id);

        loop {
            if cancel.load(Ordering::SeqCst) {
                self.audit.append(AuditRecord::new(
                    Some(&repo.id),
                    &actor,
                    "backup_cancelled",
                    format!("cancelled after {} attempts", schedule.attempts()),
                ))?;
                job.status = JobStatus::Failed;
                job.error_message = Some("cancelled".to_string());
                job.retry_count = schedule.attempts().saturating_sub(1);
                self.metrics.backup_failed();
                return Ok(None);
            }

            let attempt = schedule.begin_attempt();
            self.metrics.backup_attempt();
            debug!(job_id = %job.id, attempt, "Starting backup attempt");

            match self.engine.backup(targets, repo).await {
                Ok(receipt) => {
                    schedule.record_success();
                    self.audit.append(AuditRecord::new(
                        Some(&repo.id),
                        &actor,
                        "backup_attempt",
                        format!("attempt={attempt} succeeded"),
                    ))?;

                    let snapshot = Snapshot {
                        id: receipt.snapshot_id.clone(),
                        short_id: Snapshot::short_id_of(&receipt.snapshot_id),
                        repository_id: repo.id.clone(),
                        timestamp: Utc::now(),
                        tags: job.tags.clone(),
                        paths: targets.iter().map(|t| t.path.clone()).collect(),
                        total_size: receipt.stats.bytes_processed,
                        file_count: receipt.stats.files_processed,
                    };
                    self.store.upsert(&snapshot)?;

                    self.audit.append(AuditRecord::new(
                        Some(&repo.id),
                        &actor,
                        "backup_completed",
                        format!("snapshot={} attempts={attempt}", receipt.snapshot_id),
                    ))?;

                    job.status = JobStatus::Completed;
                    job.bytes_processed = receipt.stats.bytes_processed;
                    job.files_processed = receipt.stats.files_processed;
                    job.retry_count = attempt - 1;
                    job.error_message = None;
                    self.metrics.backup_completed();
                    info!(
                        job_id = %job.id,
                        snapshot_id = %receipt.snapshot_id,
                        attempts = attempt,
                        "Backup completed"
                    );
                    return Ok(Some(receipt.snapshot_id));
                }
                Err(err) => {
                    let transient = err.is_transient();
                    self.audit.append(AuditRecord::new(
                        Some(&repo.id),
                        &actor,
                        "backup_attempt",
                        format!("attempt={attempt} failed: {err}"),
                    ))?;
                    job.error_message = Some(err.to_string());

                    match schedule.record_failure(transient) {
                        FailureDisposition::Retry(delay) => {
                            warn!(
                                job_id = %job.id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Transient failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        FailureDisposition::GiveUp => {
                            self.audit.append(AuditRecord::new(
                                Some(&repo.id),
                                &actor,
                                "backup_failed",
                                format!("attempts={attempt} last_error={err}"),
                            ))?;
                            job.status = JobStatus::Failed;
                            job.retry_count = attempt - 1;
                            self.metrics.backup_failed();
                            warn!(job_id = %job.id, attempts = attempt, error = %err, "Backup failed");
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// List, evaluate, forget, and record one repository's retention sweep.
    pub async fn retention_sweep(
        &self,
        repository_id: &str,
        mode: AcquireMode,
    ) -> Result<SweepReport> {
        let repo = self
            .repositories
            .get(repository_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("unknown repository: {repository_id}"))
            })?;
        let policy = self
            .policies
            .get(repository_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "no retention policy configured for repository: {repository_id}"
                ))
            })?;

        let holder = Uuid::new_v4();
        let token = self
            .locks
            .acquire(repository_id, holder, self.lock_ttl, mode, &self.audit)
            .await?;
        let renewal = self.spawn_lock_renewal(&token);
        let outcome = self.sweep_locked(&repo, &policy).await;
        renewal.abort();
        if let Err(e) = self.locks.release(token) {
            warn!(repository_id, error = %e, "Failed to release repository lock");
        }
        outcome
    }

    async fn sweep_locked(
        &self,
        repo: &Repository,
        policy: &RetentionPolicy,
    ) -> Result<SweepReport> {
        let now = Utc::now();
        let snapshots = self.store.list_for_repository(&repo.id)?;
        let decision = evaluate(&snapshots, policy, now, &self.protect_tag)?;

        if decision.prune.is_empty() {
            self.audit.append(AuditRecord::new(
                Some(&repo.id),
                "orchestrator",
                "retention_sweep",
                format!("kept={} pruned=0", decision.keep.len()),
            ))?;
            info!(repository_id = %repo.id, kept = decision.keep.len(), "Nothing to prune");
            return Ok(SweepReport {
                repository_id: repo.id.clone(),
                kept: decision.keep.len(),
                pruned: Vec::new(),
            });
        }

        if let Err(err) = self.engine.forget(&decision.prune, true, repo).await {
            self.audit.append(AuditRecord::new(
                Some(&repo.id),
                "orchestrator",
                "retention_sweep",
                format!("failed: {err}"),
            ))?;
            return Err(err.into());
        }

        for snapshot_id in &decision.prune {
            self.store.remove(&repo.id, snapshot_id)?;
        }
        self.store.record_sweep(&repo.id, now)?;
        self.metrics.snapshots_pruned(decision.prune.len() as u64);

        self.audit.append(AuditRecord::new(
            Some(&repo.id),
            "orchestrator",
            "retention_sweep",
            format!("kept={} pruned={}", decision.keep.len(), decision.prune.len()),
        ))?;
        info!(
            repository_id = %repo.id,
            kept = decision.keep.len(),
            pruned = decision.prune.len(),
            "Retention sweep completed"
        );

        Ok(SweepReport {
            repository_id: repo.id.clone(),
            kept: decision.keep.len(),
            pruned: decision.prune,
        })
    }

    fn validate(&self, job: &BackupJob) -> Result<(Repository, Vec<BackupTarget>)> {
        if job.target_ids.is_empty() {
            return Err(OrchestratorError::Validation(
                "job has an empty target list".to_string(),
            ));
        }
        let repo = self
            .repositories
            .get(&job.repository_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "unknown repository: {}",
                    job.repository_id
                ))
            })?;
        let policy = self.policies.get(&job.repository_id).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "no retention policy configured for repository: {}",
                job.repository_id
            ))
        })?;
        policy.validate()?;

        let targets = job
            .target_ids
            .iter()
            .map(|id| {
                self.targets.get(id).cloned().ok_or_else(|| {
                    OrchestratorError::Validation(format!("unknown target: {id}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((repo, targets))
    }

    /// Keep the repository lock alive while engine calls run. Renewing at
    /// half the TTL means a live holder never expires mid-operation; the
    /// task stops on its own if the lock was reclaimed anyway.
    fn spawn_lock_renewal(&self, token: &LockToken) -> JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let token = token.clone();
        let ttl = self.lock_ttl;
        let interval = ttl
            .to_std()
            .map(|d| d / 2)
            .unwrap_or_else(|_| std::time::Duration::from_secs(900))
            .max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if locks.renew(&token, ttl).is_err() {
                    debug!(repository_id = %token.repository_id, "Lock renewal stopped");
                    break;
                }
            }
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn lock_cancel_flags(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<AtomicBool>>> {
        self.cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
