//! Append-only, hash-chained audit ledger
//!
//! Every orchestrated operation lands here as an immutable entry whose hash
//! covers the previous entry's hash, so any edit to history is detectable by
//! a single linear verification pass. The log is the compliance artifact of
//! the system: if an entry cannot be persisted, the enclosing operation is
//! treated as failed even when the engine itself succeeded.

mod chain;
mod entry;

pub use chain::{AuditLog, ChainStatus, ExportFormat};
pub use entry::{AuditLogEntry, AuditRecord, GENESIS_HASH, compute_entry_hash};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("audit record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit chain broken at sequence {broken_at}")]
    ChainIntegrity { broken_at: u64 },

    #[error("malformed audit segment: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;
