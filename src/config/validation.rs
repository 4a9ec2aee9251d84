use std::collections::HashSet;

use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("duplicate repository id: {id}")]
    DuplicateRepository { id: String },

    #[error("duplicate target id: {id}")]
    DuplicateTarget { id: String },

    #[error("retention policy references unknown repository: {repository_id}")]
    DanglingPolicy { repository_id: String },

    #[error("more than one retention policy for repository: {repository_id}")]
    DuplicatePolicy { repository_id: String },

    #[error("retention policy for {repository_id} keeps nothing (all buckets are zero)")]
    EmptyPolicy { repository_id: String },

    #[error("retry multiplier must be >= 1.0, got {multiplier}")]
    InvalidRetryMultiplier { multiplier: f64 },

    #[error("retry max_attempts must be >= 1")]
    InvalidRetryAttempts,

    #[error("max_concurrent_jobs must be >= 1")]
    InvalidConcurrency,
}

/// Cross-reference checks that run once at startup, so a bad config fails
/// loudly before any lock or engine call.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    let mut repo_ids = HashSet::new();
    for repo in &config.repositories {
        if !repo_ids.insert(repo.id.as_str()) {
            return Err(ValidationError::DuplicateRepository {
                id: repo.id.clone(),
            });
        }
    }

    let mut target_ids = HashSet::new();
    for target in &config.targets {
        if !target_ids.insert(target.id.as_str()) {
            return Err(ValidationError::DuplicateTarget {
                id: target.id.clone(),
            });
        }
    }

    let mut policy_repos = HashSet::new();
    for policy in &config.policies {
        if !repo_ids.contains(policy.repository_id.as_str()) {
            return Err(ValidationError::DanglingPolicy {
                repository_id: policy.repository_id.clone(),
            });
        }
        if !policy_repos.insert(policy.repository_id.as_str()) {
            return Err(ValidationError::DuplicatePolicy {
                repository_id: policy.repository_id.clone(),
            });
        }
        let keeps_nothing = policy.last == 0
            && policy.hourly == 0
            && policy.daily == 0
            && policy.weekly == 0
            && policy.monthly == 0
            && policy.yearly == 0;
        if keeps_nothing {
            return Err(ValidationError::EmptyPolicy {
                repository_id: policy.repository_id.clone(),
            });
        }
    }

    let retry = &config.orchestrator.retry;
    if retry.multiplier < 1.0 {
        return Err(ValidationError::InvalidRetryMultiplier {
            multiplier: retry.multiplier,
        });
    }
    if retry.max_attempts == 0 {
        return Err(ValidationError::InvalidRetryAttempts);
    }
    if config.orchestrator.max_concurrent_jobs == 0 {
        return Err(ValidationError::InvalidConcurrency);
    }

    Ok(())
}
