use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a backup job. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A submitted backup request and everything the orchestrator learns while
/// driving it. Mutated only by the orchestrator during its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: Uuid,
    pub repository_id: String,
    pub target_ids: Vec<String>,
    pub tags: Vec<String>,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bytes_processed: u64,
    pub files_processed: u64,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl BackupJob {
    pub fn new(
        repository_id: impl Into<String>,
        target_ids: Vec<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository_id: repository_id.into(),
            target_ids,
            tags,
            scheduled_time: Utc::now(),
            status: JobStatus::Pending,
            start_time: None,
            end_time: None,
            bytes_processed: 0,
            files_processed: 0,
            error_message: None,
            retry_count: 0,
        }
    }
}

/// Final outcome handed back to the caller once the job reached a terminal
/// state. A failed job always carries a non-empty `error_message` inside
/// the job record.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: BackupJob,
    pub snapshot_id: Option<String>,
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}
