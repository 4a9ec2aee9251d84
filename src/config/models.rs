use serde::Deserialize;
use std::path::PathBuf;

use crate::humanize::{ByteSize, HumanDuration};
use crate::engine::{Repository, RepositoryKind};
use crate::retention::RetentionPolicy;

/// Root configuration. Every section has working defaults; repositories,
/// targets and policies come from the TOML file or environment only.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    /// Snapshots carrying this tag are never pruned.
    #[serde(default = "default_protect_tag")]
    pub protect_tag: String,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,

    /// Segment rotation threshold for the jsonl ledger files.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: ByteSize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            max_segment_bytes: default_max_segment_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: HumanDuration,

    #[serde(default = "default_lock_queue_depth")]
    pub lock_queue_depth: usize,

    #[serde(default)]
    pub verify_after_backup: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            lock_ttl: default_lock_ttl(),
            lock_queue_depth: default_lock_queue_depth(),
            verify_after_backup: false,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: HumanDuration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_delay")]
    pub max_delay: HumanDuration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> crate::orchestrator::RetryPolicy {
        crate::orchestrator::RetryPolicy {
            initial_delay: self.initial_delay.as_duration(),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            max_delay: self.max_delay.as_duration(),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Ceiling on the deep data consistency read. Hitting it downgrades the
    /// check to a warning.
    #[serde(default = "default_data_check_timeout")]
    pub data_check_timeout: HumanDuration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            data_check_timeout: default_data_check_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub uri: String,
    pub kind: RepositoryKind,
    #[serde(default)]
    pub encrypted: bool,
}

impl RepositoryConfig {
    pub fn to_repository(&self) -> Repository {
        Repository {
            id: self.id.clone(),
            uri: self.uri.clone(),
            kind: self.kind,
            encrypted: self.encrypted,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub repository_id: String,
    #[serde(default)]
    pub last: u32,
    #[serde(default)]
    pub hourly: u32,
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            repository_id: self.repository_id.clone(),
            last: self.last,
            hourly: self.hourly,
            daily: self.daily,
            weekly: self.weekly,
            monthly: self.monthly,
            yearly: self.yearly,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit: AuditConfig::default(),
            store: StoreConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            verification: VerificationConfig::default(),
            protect_tag: default_protect_tag(),
            repositories: Vec::new(),
            targets: Vec::new(),
            policies: Vec::new(),
        }
    }
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("data/audit")
}

fn default_max_segment_bytes() -> ByteSize {
    ByteSize(64 * 1024 * 1024)
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/snapshots")
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_lock_ttl() -> HumanDuration {
    HumanDuration(30 * 60_000)
}

fn default_lock_queue_depth() -> usize {
    16
}

fn default_initial_delay() -> HumanDuration {
    HumanDuration(1_000)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_delay() -> HumanDuration {
    HumanDuration(60_000)
}

fn default_data_check_timeout() -> HumanDuration {
    HumanDuration(5 * 60_000)
}

fn default_protect_tag() -> String {
    "protect".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_concurrent_jobs, 4);
        assert_eq!(config.orchestrator.lock_ttl.as_millis(), 30 * 60_000);
        assert_eq!(config.orchestrator.retry.max_attempts, 3);
        assert_eq!(config.audit.max_segment_bytes.as_u64(), 64 * 1024 * 1024);
        assert_eq!(config.protect_tag, "protect");
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_retry_config_to_policy() {
        let retry = RetryConfig::default();
        let policy = retry.to_policy();
        assert_eq!(policy.initial_delay, std::time::Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, std::time::Duration::from_secs(60));
    }
}
