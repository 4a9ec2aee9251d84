//! Restic subprocess adapter
//!
//! Thin `BackupEngine` implementation that shells out to the `restic` binary
//! and parses its `--json` output. Credentials are resolved through the
//! `CredentialGateway` right before each invocation and passed via the
//! process environment, never via arguments or logs.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::credentials::CredentialGateway;

use super::{
    BackupEngine, BackupReceipt, BackupStats, BackupTarget, CheckReport, EngineError, Repository,
    RestoreOptions, RestoreReport, Result,
};

/// Markers in restic stderr that indicate a retryable condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "repository is already locked",
    "rate limit",
    "too many requests",
    "network is unreachable",
];

/// Markers that indicate a failure retrying cannot fix.
const PERMANENT_MARKERS: &[&str] = &[
    "wrong password",
    "no key found",
    "permission denied",
    "no space left on device",
    "no such file or directory",
];

pub struct ResticCli {
    binary: PathBuf,
    credentials: Arc<dyn CredentialGateway>,
}

impl ResticCli {
    pub fn new(binary: impl Into<PathBuf>, credentials: Arc<dyn CredentialGateway>) -> Self {
        Self {
            binary: binary.into(),
            credentials,
        }
    }

    async fn command(&self, repo: &Repository) -> Result<Command> {
        let creds = self
            .credentials
            .resolve(&repo.id)
            .await
            .map_err(|e| EngineError::auth(e.to_string()))?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r")
            .arg(&repo.uri)
            .env("RESTIC_PASSWORD", creds.secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, mut cmd: Command, action: &str) -> Result<Vec<u8>> {
        debug!(action, "Invoking restic");
        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Permanent(format!("failed to spawn restic: {e}")))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(classify_failure(action, output.status.code(), &stderr))
    }
}

/// Map a nonzero restic exit to the transient/permanent taxonomy.
///
/// Unrecognized failures default to permanent so that a genuinely broken
/// setup fails fast instead of burning the retry budget.
pub fn classify_failure(action: &str, exit_code: Option<i32>, stderr: &str) -> EngineError {
    let haystack = stderr.to_lowercase();
    let summary = format!(
        "restic {} exited with code {:?}: {}",
        action,
        exit_code,
        stderr.lines().last().unwrap_or("").trim()
    );

    if TRANSIENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        return EngineError::Transient(summary);
    }
    if PERMANENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        return EngineError::Permanent(summary);
    }
    EngineError::Permanent(summary)
}

/// Argument vector for `restic restore`. restic overwrites existing files
/// by default, so `overwrite: false` maps to `--overwrite never`.
fn restore_args(snapshot_id: &str, target_path: &str, options: &RestoreOptions) -> Vec<String> {
    let mut args = vec![
        "restore".to_string(),
        snapshot_id.to_string(),
        "--target".to_string(),
        target_path.to_string(),
    ];
    if !options.overwrite {
        args.push("--overwrite".to_string());
        args.push("never".to_string());
    }
    for include in &options.include_paths {
        args.push("--include".to_string());
        args.push(include.clone());
    }
    args
}

/// The `--json backup` summary line restic prints on success.
#[derive(Debug, Deserialize)]
struct BackupSummary {
    message_type: String,
    snapshot_id: Option<String>,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    total_files_processed: u64,
}

fn parse_backup_summary(stdout: &[u8]) -> Result<BackupReceipt> {
    for line in String::from_utf8_lossy(stdout).lines().rev() {
        let Ok(summary) = serde_json::from_str::<BackupSummary>(line) else {
            continue;
        };
        if summary.message_type != "summary" {
            continue;
        }
        let snapshot_id = summary
            .snapshot_id
            .ok_or_else(|| EngineError::Permanent("backup summary missing snapshot id".into()))?;
        return Ok(BackupReceipt {
            snapshot_id,
            stats: BackupStats {
                bytes_processed: summary.total_bytes_processed,
                files_processed: summary.total_files_processed,
            },
        });
    }
    Err(EngineError::Permanent(
        "restic backup produced no summary line".into(),
    ))
}

#[async_trait]
impl BackupEngine for ResticCli {
    async fn backup(&self, targets: &[BackupTarget], repo: &Repository) -> Result<BackupReceipt> {
        let mut cmd = self.command(repo).await?;
        cmd.arg("backup").arg("--json");
        for target in targets {
            cmd.arg(&target.path);
        }

        let stdout = self.run(cmd, "backup").await?;
        let receipt = parse_backup_summary(&stdout)?;
        info!(
            repository_id = %repo.id,
            snapshot_id = %receipt.snapshot_id,
            bytes = receipt.stats.bytes_processed,
            "Backup finished"
        );
        Ok(receipt)
    }

    async fn restore(
        &self,
        snapshot_id: &str,
        target_path: &str,
        repo: &Repository,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let mut cmd = self.command(repo).await?;
        cmd.args(restore_args(snapshot_id, target_path, &options));

        self.run(cmd, "restore").await?;
        Ok(RestoreReport {
            snapshot_id: snapshot_id.to_string(),
            restored_to: target_path.to_string(),
        })
    }

    async fn forget(&self, snapshot_ids: &[String], prune: bool, repo: &Repository) -> Result<()> {
        if snapshot_ids.is_empty() {
            return Ok(());
        }
        let mut cmd = self.command(repo).await?;
        cmd.arg("forget");
        if prune {
            cmd.arg("--prune");
        }
        for id in snapshot_ids {
            cmd.arg(id);
        }

        self.run(cmd, "forget").await?;
        info!(repository_id = %repo.id, count = snapshot_ids.len(), "Snapshots forgotten");
        Ok(())
    }

    async fn check(&self, repo: &Repository, deep: bool) -> Result<CheckReport> {
        let mut cmd = self.command(repo).await?;
        cmd.arg("check");
        if deep {
            cmd.arg("--read-data");
        }

        match self.run(cmd, "check").await {
            Ok(stdout) => Ok(CheckReport {
                passed: true,
                detail: String::from_utf8_lossy(&stdout)
                    .lines()
                    .last()
                    .unwrap_or("no errors were found")
                    .to_string(),
            }),
            Err(EngineError::Permanent(detail)) => Ok(CheckReport {
                passed: false,
                detail,
            }),
            Err(e) => Err(e),
        }
    }
}
