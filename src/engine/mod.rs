//! BackupEngine boundary
//!
//! The engine is an external collaborator: it moves the actual data
//! (deduplication, compression, encryption) and hands back snapshot ids and
//! stats. The orchestrator treats every call as slow, possibly-failing
//! subprocess or network I/O.

pub mod restic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine failures split into the two classes the retry policy cares about.
///
/// Transient failures (network timeouts, remote lock contention, rate limits)
/// are retried; permanent failures (bad credentials, invalid paths, full
/// destination disk) fail the job on the first occurrence.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient engine failure: {0}")]
    Transient(String),

    #[error("permanent engine failure: {0}")]
    Permanent(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        EngineError::Transient(format!("timeout: {}", detail.into()))
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        EngineError::Transient(format!("rate limited: {}", detail.into()))
    }

    pub fn remote_locked(detail: impl Into<String>) -> Self {
        EngineError::Transient(format!("repository locked: {}", detail.into()))
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        EngineError::Permanent(format!("authentication failed: {}", detail.into()))
    }

    pub fn invalid_path(detail: impl Into<String>) -> Self {
        EngineError::Permanent(format!("invalid path: {}", detail.into()))
    }

    pub fn destination_full(detail: impl Into<String>) -> Self {
        EngineError::Permanent(format!("destination full: {}", detail.into()))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Storage backend behind a repository URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Local,
    S3,
    Sftp,
    Smb,
    B2,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryKind::Local => "local",
            RepositoryKind::S3 => "s3",
            RepositoryKind::Sftp => "sftp",
            RepositoryKind::Smb => "smb",
            RepositoryKind::B2 => "b2",
        }
    }
}

/// A configured backup destination. The configuration layer owns these;
/// the orchestrator never mutates `uri` or `kind`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Repository {
    pub id: String,
    pub uri: String,
    pub kind: RepositoryKind,
    #[serde(default)]
    pub encrypted: bool,
}

/// A configured backup source, referenced from jobs by id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupTarget {
    pub id: String,
    pub path: String,
}

/// Counters reported by the engine for one backup run.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct BackupStats {
    pub bytes_processed: u64,
    pub files_processed: u64,
}

/// What a successful backup hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct BackupReceipt {
    pub snapshot_id: String,
    pub stats: BackupStats,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub overwrite: bool,
    pub include_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub restored_to: String,
}

/// Outcome of an engine-level repository check.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub passed: bool,
    pub detail: String,
}

impl CheckReport {
    pub fn passed() -> Self {
        Self {
            passed: true,
            detail: "ok".to_string(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// The data-moving engine behind the orchestrator.
///
/// One implementation per backend family is resolved at configuration time;
/// the orchestrator only ever sees this trait.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Run a backup of the given targets into the repository.
    async fn backup(&self, targets: &[BackupTarget], repo: &Repository) -> Result<BackupReceipt>;

    /// Restore a snapshot into `target_path`.
    async fn restore(
        &self,
        snapshot_id: &str,
        target_path: &str,
        repo: &Repository,
        options: RestoreOptions,
    ) -> Result<RestoreReport>;

    /// Remove snapshots from the repository. With `prune` set, unreferenced
    /// data is reclaimed as well.
    async fn forget(&self, snapshot_ids: &[String], prune: bool, repo: &Repository) -> Result<()>;

    /// Check repository integrity. `deep` reads back data blobs and may take
    /// a very long time on large repositories.
    async fn check(&self, repo: &Repository, deep: bool) -> Result<CheckReport>;
}
