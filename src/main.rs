mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use uuid::Uuid;

use cli::{
    AuditCommands, BackupArgs, Cli, Commands, ExportFormatArg, PruneArgs, RestoreArgs, VerifyArgs,
};
use timelocker::audit::{AuditError, AuditLog, AuditRecord, ExportFormat};
use timelocker::config::Config;
use timelocker::credentials::EnvCredentialGateway;
use timelocker::engine::restic::ResticCli;
use timelocker::engine::{BackupEngine, RestoreOptions};
use timelocker::lock::{AcquireMode, LockError, LockManager};
use timelocker::observability::Metrics;
use timelocker::orchestrator::{
    BackupJob, JobStatus, Orchestrator, OrchestratorError, OrchestratorSettings,
};
use timelocker::snapshots::SnapshotStore;
use timelocker::verify::VerificationService;

const EXIT_FAILURE: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_LOCKED: u8 = 3;
const EXIT_ENGINE: u8 = 4;
const EXIT_AUDIT: u8 = 5;
const EXIT_CHAIN_BROKEN: u8 = 6;
const EXIT_VERIFY_FAILED: u8 = 7;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    let app = match App::build(config) {
        Ok(app) => app,
        Err(code) => return code,
    };

    match cli.command {
        Commands::Backup(args) => app.backup(args).await,
        Commands::Prune(args) => app.prune(args).await,
        Commands::Restore(args) => app.restore(args).await,
        Commands::Verify(args) => app.verify(args).await,
        Commands::Audit(args) => app.audit_command(args.command),
        Commands::Unlock(args) => app.unlock(&args.repository),
    }
}

fn load_config(cli: &Cli) -> Result<Config, timelocker::config::ConfigError> {
    match &cli.config {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    }
}

struct App {
    config: Config,
    audit: Arc<AuditLog>,
    store: SnapshotStore,
    locks: Arc<LockManager>,
    engine: Arc<ResticCli>,
    orchestrator: Arc<Orchestrator>,
    verifier: Arc<VerificationService>,
}

impl App {
    fn build(config: Config) -> Result<Self, ExitCode> {
        let audit = match AuditLog::open(
            &config.audit.path,
            config.audit.max_segment_bytes.as_u64(),
        ) {
            Ok(audit) => Arc::new(audit),
            Err(err) => {
                error!("Failed to open audit log: {err}");
                return Err(ExitCode::from(audit_exit(&err)));
            }
        };

        let store = match SnapshotStore::open(&config.store.path) {
            Ok(store) => store,
            Err(err) => {
                error!("Failed to open snapshot store: {err}");
                return Err(ExitCode::from(EXIT_AUDIT));
            }
        };

        let locks = Arc::new(LockManager::new(config.orchestrator.lock_queue_depth));
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(ResticCli::new("restic", Arc::new(EnvCredentialGateway)));
        let verifier = Arc::new(VerificationService::new(
            engine.clone(),
            audit.clone(),
            metrics.clone(),
            config.verification.data_check_timeout.as_duration(),
        ));

        let settings: OrchestratorSettings = config.orchestrator_settings();
        let orchestrator = Arc::new(
            Orchestrator::new(
                engine.clone(),
                store.clone(),
                audit.clone(),
                locks.clone(),
                metrics,
                settings,
            )
            .with_verifier(verifier.clone()),
        );

        Ok(Self {
            config,
            audit,
            store,
            locks,
            engine,
            orchestrator,
            verifier,
        })
    }

    async fn backup(&self, args: BackupArgs) -> ExitCode {
        let targets = if args.targets.is_empty() {
            self.config.targets.iter().map(|t| t.id.clone()).collect()
        } else {
            args.targets
        };
        let job = BackupJob::new(args.repository, targets, args.tags);
        let mode = acquire_mode(args.fail_fast);

        match self.orchestrator.run(job, mode).await {
            Ok(result) if result.status() == JobStatus::Completed => {
                let snapshot = result.snapshot_id.unwrap_or_default();
                println!(
                    "backup completed: snapshot={snapshot} bytes={} files={}",
                    result.job.bytes_processed, result.job.files_processed
                );
                ExitCode::SUCCESS
            }
            Ok(result) => {
                let reason = result
                    .job
                    .error_message
                    .unwrap_or_else(|| "unknown failure".to_string());
                error!("Backup failed: {reason}");
                ExitCode::from(EXIT_ENGINE)
            }
            Err(err) => {
                error!("Backup aborted: {err}");
                ExitCode::from(orchestrator_exit(&err))
            }
        }
    }

    async fn prune(&self, args: PruneArgs) -> ExitCode {
        let mode = acquire_mode(args.fail_fast);
        match self
            .orchestrator
            .retention_sweep(&args.repository, mode)
            .await
        {
            Ok(report) => {
                println!(
                    "retention sweep: kept={} pruned={}",
                    report.kept,
                    report.pruned.len()
                );
                for snapshot_id in &report.pruned {
                    println!("pruned {snapshot_id}");
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("Retention sweep failed: {err}");
                ExitCode::from(orchestrator_exit(&err))
            }
        }
    }

    async fn restore(&self, args: RestoreArgs) -> ExitCode {
        let repo = match self
            .config
            .repositories
            .iter()
            .find(|r| r.id == args.repository)
        {
            Some(repo) => repo.to_repository(),
            None => {
                error!("Unknown repository: {}", args.repository);
                return ExitCode::from(EXIT_INVALID);
            }
        };

        // Restores take the repository lock like any other operation, so a
        // concurrent prune cannot forget the snapshot mid-restore.
        let ttl = chrono::Duration::from_std(self.config.orchestrator.lock_ttl.as_duration())
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        let token = match self
            .locks
            .acquire(
                &repo.id,
                Uuid::new_v4(),
                ttl,
                acquire_mode(args.fail_fast),
                &self.audit,
            )
            .await
        {
            Ok(token) => token,
            Err(err) => {
                error!("Restore aborted: {err}");
                return ExitCode::from(match &err {
                    LockError::Audit(audit_err) => audit_exit(audit_err),
                    _ => EXIT_LOCKED,
                });
            }
        };

        let options = RestoreOptions {
            overwrite: args.overwrite,
            include_paths: args.include.clone(),
        };
        let target = args.target.display().to_string();
        let outcome = self.engine.restore(&args.snapshot, &target, &repo, options).await;

        let entry = match &outcome {
            Ok(report) => format!(
                "snapshot={} target={}",
                report.snapshot_id, report.restored_to
            ),
            Err(err) => format!("snapshot={} failed: {err}", args.snapshot),
        };
        let appended = self
            .audit
            .append(AuditRecord::new(Some(&repo.id), "cli", "restore", entry));
        if let Err(err) = self.locks.release(token) {
            error!("Failed to release repository lock: {err}");
        }
        if let Err(err) = appended {
            error!("Audit append failed: {err}");
            return ExitCode::from(audit_exit(&err));
        }

        match outcome {
            Ok(report) => {
                println!(
                    "restored snapshot {} to {}",
                    report.snapshot_id, report.restored_to
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("Restore failed: {err}");
                ExitCode::from(EXIT_ENGINE)
            }
        }
    }

    async fn verify(&self, args: VerifyArgs) -> ExitCode {
        let repo = match self
            .config
            .repositories
            .iter()
            .find(|r| r.id == args.repository)
        {
            Some(repo) => repo.to_repository(),
            None => {
                error!("Unknown repository: {}", args.repository);
                return ExitCode::from(EXIT_INVALID);
            }
        };
        let snapshot = match self.store.get(&args.repository, &args.snapshot) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                error!("Unknown snapshot: {}", args.snapshot);
                return ExitCode::from(EXIT_INVALID);
            }
            Err(err) => {
                error!("Snapshot store failure: {err}");
                return ExitCode::from(EXIT_AUDIT);
            }
        };

        match self.verifier.verify(&snapshot, &repo).await {
            Ok(result) if result.success => {
                println!("verification passed: snapshot={}", snapshot.id);
                for warning in &result.warnings {
                    println!("warning: {warning}");
                }
                ExitCode::SUCCESS
            }
            Ok(result) => {
                for problem in &result.errors {
                    error!("{problem}");
                }
                ExitCode::from(EXIT_VERIFY_FAILED)
            }
            Err(err) => {
                error!("Verification aborted: {err}");
                ExitCode::from(audit_exit(&err))
            }
        }
    }

    fn audit_command(&self, command: AuditCommands) -> ExitCode {
        match command {
            AuditCommands::Verify => match self.audit.verify_chain() {
                Ok(status) if status.ok => {
                    println!("audit chain verified: {} entries", self.audit.len());
                    ExitCode::SUCCESS
                }
                Ok(status) => {
                    error!(
                        "Audit chain broken at sequence {}",
                        status.broken_at.unwrap_or_default()
                    );
                    ExitCode::from(EXIT_CHAIN_BROKEN)
                }
                Err(err) => {
                    error!("Audit chain verification failed: {err}");
                    ExitCode::from(audit_exit(&err))
                }
            },
            AuditCommands::Export(args) => {
                let format = match args.format {
                    ExportFormatArg::Jsonl => ExportFormat::Jsonl,
                    ExportFormatArg::Json => ExportFormat::Json,
                };
                match self.audit.export(format) {
                    Ok(bytes) => {
                        use std::io::Write;
                        if std::io::stdout().write_all(&bytes).is_err() {
                            return ExitCode::from(EXIT_FAILURE);
                        }
                        ExitCode::SUCCESS
                    }
                    Err(err) => {
                        error!("Audit export failed: {err}");
                        ExitCode::from(audit_exit(&err))
                    }
                }
            }
        }
    }

    fn unlock(&self, repository_id: &str) -> ExitCode {
        match self.locks.force_break(repository_id, "cli", &self.audit) {
            Ok(true) => {
                println!("lock on {repository_id} broken");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("no lock held on {repository_id}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("Unlock failed: {err}");
                ExitCode::from(match &err {
                    LockError::Audit(audit_err) => audit_exit(audit_err),
                    _ => EXIT_LOCKED,
                })
            }
        }
    }
}

fn acquire_mode(fail_fast: bool) -> AcquireMode {
    if fail_fast {
        AcquireMode::FailFast
    } else {
        AcquireMode::Queue
    }
}

fn audit_exit(err: &AuditError) -> u8 {
    match err {
        AuditError::ChainIntegrity { .. } => EXIT_CHAIN_BROKEN,
        _ => EXIT_AUDIT,
    }
}

fn orchestrator_exit(err: &OrchestratorError) -> u8 {
    match err {
        OrchestratorError::Validation(_) | OrchestratorError::Policy(_) => EXIT_INVALID,
        OrchestratorError::Lock(LockError::Audit(audit_err)) => audit_exit(audit_err),
        OrchestratorError::Lock(_) => EXIT_LOCKED,
        OrchestratorError::Engine(_) => EXIT_ENGINE,
        OrchestratorError::Audit(audit_err) => audit_exit(audit_err),
        OrchestratorError::Store(_) => EXIT_AUDIT,
        OrchestratorError::Aborted => EXIT_FAILURE,
    }
}
