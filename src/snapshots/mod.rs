//! Snapshot metadata store
//!
//! Fjall-backed index of the snapshots known per repository. The engine owns
//! the snapshot data itself; this store mirrors the metadata the orchestrator
//! and the retention evaluator work from. All mutations happen while the
//! caller holds the repository lock, so a completing backup and a concurrent
//! retention sweep cannot lose each other's updates.

use std::path::Path;

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Point-in-time immutable record of backed-up data, as reported by the
/// engine and mirrored here. Deleted only via an explicit forget, never
/// silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub short_id: String,
    pub repository_id: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub total_size: u64,
    pub file_count: u64,
}

impl Snapshot {
    pub fn short_id_of(id: &str) -> String {
        id.chars().take(8).collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Fjall-backed persistent snapshot index.
///
/// Layout:
/// - `snapshots` partition: `{repository_id}/{snapshot_id}` → Snapshot (JSON)
/// - `metadata` partition: `sweep/{repository_id}` → RFC 3339 timestamp of
///   the last completed retention sweep
#[derive(Clone)]
pub struct SnapshotStore {
    keyspace: Keyspace,
    snapshots: PartitionHandle,
    metadata: PartitionHandle,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening snapshot store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let snapshots = keyspace.open_partition("snapshots", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            snapshots,
            metadata,
        })
    }

    fn key(repository_id: &str, snapshot_id: &str) -> String {
        format!("{repository_id}/{snapshot_id}")
    }

    pub fn upsert(&self, snapshot: &Snapshot) -> Result<()> {
        let key = Self::key(&snapshot.repository_id, &snapshot.id);
        let value = serde_json::to_vec(snapshot)?;
        self.snapshots.insert(key, value)?;
        debug!(
            repository_id = %snapshot.repository_id,
            snapshot_id = %snapshot.id,
            "Snapshot recorded"
        );
        Ok(())
    }

    pub fn get(&self, repository_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let key = Self::key(repository_id, snapshot_id);
        match self.snapshots.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, repository_id: &str, snapshot_id: &str) -> Result<()> {
        let key = Self::key(repository_id, snapshot_id);
        self.snapshots.remove(key)?;
        debug!(repository_id, snapshot_id, "Snapshot removed from index");
        Ok(())
    }

    /// All known snapshots for one repository, in key order.
    pub fn list_for_repository(&self, repository_id: &str) -> Result<Vec<Snapshot>> {
        let prefix = format!("{repository_id}/");
        let mut result = Vec::new();
        for item in self.snapshots.prefix(prefix) {
            let (_, value) = item?;
            result.push(serde_json::from_slice(&value)?);
        }
        Ok(result)
    }

    /// Record that a retention sweep finished for this repository.
    pub fn record_sweep(&self, repository_id: &str, at: DateTime<Utc>) -> Result<()> {
        let key = format!("sweep/{repository_id}");
        self.metadata.insert(key, at.to_rfc3339().as_bytes())?;
        Ok(())
    }

    pub fn last_sweep(&self, repository_id: &str) -> Result<Option<DateTime<Utc>>> {
        let key = format!("sweep/{repository_id}");
        match self.metadata.get(key)? {
            Some(value) => {
                let text = String::from_utf8_lossy(&value).to_string();
                Ok(DateTime::parse_from_rfc3339(&text)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut snapshot_count = 0;
        for item in self.snapshots.iter() {
            item?;
            snapshot_count += 1;
        }
        Ok(StoreStats { snapshot_count })
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub snapshot_count: usize,
}
