use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("retention policy for repository {0} keeps nothing: all buckets are zero")]
    AllBucketsDisabled(String),
}

/// How many snapshots to keep per time bucket. A zero count disables the
/// bucket; a policy with every bucket disabled would prune everything and
/// is rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
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

impl RetentionPolicy {
    pub fn is_active(&self) -> bool {
        self.last > 0
            || self.hourly > 0
            || self.daily > 0
            || self.weekly > 0
            || self.monthly > 0
            || self.yearly > 0
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.is_active() {
            return Err(PolicyError::AllBucketsDisabled(self.repository_id.clone()));
        }
        Ok(())
    }
}
