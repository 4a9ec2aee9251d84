//! Configuration management
//!
//! Layered configuration loaded from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Environment Variables
//!
//! Settings can be overridden with the pattern `TIMELOCKER__<section>__<key>`:
//! - `TIMELOCKER__ORCHESTRATOR__MAX_CONCURRENT_JOBS=8`
//! - `TIMELOCKER__ORCHESTRATOR__LOCK_TTL=10m`
//! - `TIMELOCKER__AUDIT__MAX_SEGMENT_BYTES=16MB`
//!
//! # Configuration File
//!
//! By default, configuration is loaded from `config/timelocker.toml`. This
//! can be overridden with the `TIMELOCKER_CONFIG` environment variable.
//! Repository passwords never live in the TOML file; the credential gateway
//! reads them from the environment at engine-call time.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    AuditConfig, Config, OrchestratorConfig, PolicyConfig, RepositoryConfig, RetryConfig,
    StoreConfig, TargetConfig, VerificationConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Assemble the orchestrator settings out of the validated sections.
    pub fn orchestrator_settings(&self) -> crate::orchestrator::OrchestratorSettings {
        crate::orchestrator::OrchestratorSettings {
            repositories: self.repositories.iter().map(|r| r.to_repository()).collect(),
            targets: self
                .targets
                .iter()
                .map(|t| crate::engine::BackupTarget {
                    id: t.id.clone(),
                    path: t.path.clone(),
                })
                .collect(),
            policies: self.policies.iter().map(|p| p.to_policy()).collect(),
            retry: self.orchestrator.retry.to_policy(),
            protect_tag: self.protect_tag.clone(),
            lock_ttl: self.orchestrator.lock_ttl.as_duration(),
            max_concurrent_jobs: self.orchestrator.max_concurrent_jobs,
            verify_after_backup: self.orchestrator.verify_after_backup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[[repositories]]
id = "local"
uri = "/srv/backups"
kind = "local"

[[targets]]
id = "home"
path = "/home"

[[policies]]
repository_id = "local"
daily = 7
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.policies.len(), 1);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.repositories[0].id, "local");
        assert_eq!(settings.policies[0].daily, 7);
        assert_eq!(settings.protect_tag, "protect");
    }

    #[test]
    fn test_validation_catches_dangling_policy() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[[policies]]
repository_id = "nonexistent"
daily = 7
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::DanglingPolicy { .. })
        ));
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
protect_tag = "keep-forever"

[audit]
path = "var/audit"
max_segment_bytes = "32MB"

[store]
path = "var/snapshots"

[orchestrator]
max_concurrent_jobs = 2
lock_ttl = "15m"
lock_queue_depth = 8
verify_after_backup = true

[orchestrator.retry]
initial_delay = "2s"
multiplier = 3.0
max_attempts = 4
max_delay = "2m"

[verification]
data_check_timeout = "10m"

[[repositories]]
id = "offsite"
uri = "s3://bucket/backups"
kind = "s3"
encrypted = true

[[repositories]]
id = "local"
uri = "/srv/backups"
kind = "local"

[[targets]]
id = "home"
path = "/home"

[[targets]]
id = "etc"
path = "/etc"

[[policies]]
repository_id = "offsite"
daily = 7
weekly = 4
monthly = 12

[[policies]]
repository_id = "local"
last = 3
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.protect_tag, "keep-forever");
        assert_eq!(config.orchestrator.max_concurrent_jobs, 2);
        assert!(config.orchestrator.verify_after_backup);
        assert_eq!(config.orchestrator.retry.multiplier, 3.0);
        assert_eq!(config.verification.data_check_timeout.as_millis(), 600_000);
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.policies.len(), 2);
    }
}
