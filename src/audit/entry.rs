use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the very first entry of the very first segment.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What callers hand to `AuditLog::append`. Sequence number, timestamp and
/// hashes are assigned by the log itself.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub repository_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub result: String,
}

impl AuditRecord {
    pub fn new(
        repository_id: Option<&str>,
        actor: impl Into<String>,
        action: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            repository_id: repository_id.map(str::to_string),
            actor: actor.into(),
            action: action.into(),
            result: result.into(),
        }
    }
}

/// One immutable line of the persisted ledger.
///
/// The timestamp is stored as the exact RFC 3339 string that was hashed, so
/// re-verification never depends on serialization round-trip precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence_no: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub result: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditLogEntry {
    /// Recompute this entry's hash from its own fields.
    pub fn recompute_hash(&self) -> String {
        compute_entry_hash(
            &self.prev_hash,
            self.sequence_no,
            &self.timestamp,
            &self.actor,
            &self.action,
            &self.result,
        )
    }
}

/// `entry_hash = SHA-256(prev_hash || canonical(sequence_no, timestamp, actor, action, result))`
///
/// The canonical form is the fields joined with `\n`, which cannot appear
/// inside any field of a single-line jsonl record.
pub fn compute_entry_hash(
    prev_hash: &str,
    sequence_no: u64,
    timestamp: &str,
    actor: &str,
    action: &str,
    result: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(sequence_no.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.as_bytes());
    hasher.update(b"\n");
    hasher.update(actor.as_bytes());
    hasher.update(b"\n");
    hasher.update(action.as_bytes());
    hasher.update(b"\n");
    hasher.update(result.as_bytes());
    hex::encode(hasher.finalize())
}
