use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::entry::{AuditLogEntry, AuditRecord, GENESIS_HASH};
use super::{AuditError, Result};

const SEGMENT_PREFIX: &str = "audit-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// Outcome of a full chain verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStatus {
    pub ok: bool,
    pub broken_at: Option<u64>,
}

impl ChainStatus {
    fn valid() -> Self {
        Self {
            ok: true,
            broken_at: None,
        }
    }

    fn broken(sequence_no: u64) -> Self {
        Self {
            ok: false,
            broken_at: Some(sequence_no),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// The persisted records verbatim, the compliance artifact.
    Jsonl,
    /// A pretty-printed JSON array for human consumption.
    Json,
}

#[derive(Debug)]
struct ChainState {
    dir: PathBuf,
    max_segment_bytes: u64,
    segment_index: u32,
    file: File,
    segment_bytes: u64,
    next_seq: u64,
    last_hash: String,
}

/// The append-only hash-chained ledger.
///
/// Single-writer discipline: all mutation goes through one mutex-guarded
/// state, so sequence numbers and prev-hash linkage stay race-free under
/// concurrent orchestrator callers. Entries are fsynced on every append;
/// when a segment outgrows `max_segment_bytes` a new file starts and the
/// chain continues across the boundary unbroken.
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<ChainState>,
}

impl AuditLog {
    /// Open (or create) the ledger at `dir`, verifying any existing chain
    /// before becoming ready. A broken chain refuses to open.
    pub fn open(dir: impl AsRef<Path>, max_segment_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let (segment_index, next_seq, last_hash) = if segments.is_empty() {
            (0, 0, GENESIS_HASH.to_string())
        } else {
            let entries = read_segments(&segments)?;
            let status = verify_entries(&entries);
            if let Some(broken_at) = status.broken_at {
                return Err(AuditError::ChainIntegrity { broken_at });
            }
            let last = entries.last();
            (
                segments.last().map(|(idx, _)| *idx).unwrap_or(0),
                last.map(|e| e.sequence_no + 1).unwrap_or(0),
                last.map(|e| e.entry_hash.clone())
                    .unwrap_or_else(|| GENESIS_HASH.to_string()),
            )
        };

        let path = segment_path(&dir, segment_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let segment_bytes = file.metadata()?.len();

        info!(
            dir = %dir.display(),
            segment_index,
            next_seq,
            "Audit log opened, chain verified"
        );

        Ok(Self {
            inner: Mutex::new(ChainState {
                dir,
                max_segment_bytes,
                segment_index,
                file,
                segment_bytes,
                next_seq,
                last_hash,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        // A poisoned mutex means a writer panicked mid-append; the on-disk
        // chain is still the source of truth, so keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one record. This is the only mutator of the ledger.
    ///
    /// Persistence failure is loud: the caller must treat it as fatal for
    /// the enclosing operation.
    pub fn append(&self, record: AuditRecord) -> Result<AuditLogEntry> {
        let mut state = self.state();

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let sequence_no = state.next_seq;
        let prev_hash = state.last_hash.clone();
        let entry_hash = super::entry::compute_entry_hash(
            &prev_hash,
            sequence_no,
            &timestamp,
            &record.actor,
            &record.action,
            &record.result,
        );

        let entry = AuditLogEntry {
            sequence_no,
            timestamp,
            repository_id: record.repository_id,
            actor: record.actor,
            action: record.action,
            result: record.result,
            prev_hash,
            entry_hash,
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if state.segment_bytes > 0
            && state.segment_bytes + line.len() as u64 > state.max_segment_bytes
        {
            rotate(&mut state)?;
        }

        state.file.write_all(&line)?;
        state.file.sync_all()?;
        state.segment_bytes += line.len() as u64;
        state.next_seq = sequence_no + 1;
        state.last_hash = entry.entry_hash.clone();

        debug!(
            sequence_no,
            action = %entry.action,
            "Audit entry appended"
        );

        Ok(entry)
    }

    /// Recompute every entry hash and prev-hash link from disk.
    ///
    /// The first mismatch reports the offending sequence number; an empty
    /// log is trivially valid.
    pub fn verify_chain(&self) -> Result<ChainStatus> {
        let state = self.state();
        let segments = list_segments(&state.dir)?;
        let entries = read_segments(&segments)?;
        let status = verify_entries(&entries);
        if !status.ok {
            warn!(broken_at = ?status.broken_at, "Audit chain verification failed");
        }
        Ok(status)
    }

    /// All entries across all segments, in append order.
    pub fn read_all(&self) -> Result<Vec<AuditLogEntry>> {
        let state = self.state();
        let segments = list_segments(&state.dir)?;
        read_segments(&segments)
    }

    /// Export the ledger as a compliance artifact.
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        let state = self.state();
        let segments = list_segments(&state.dir)?;
        match format {
            ExportFormat::Jsonl => {
                let mut out = Vec::new();
                for (_, path) in &segments {
                    out.extend_from_slice(&fs::read(path)?);
                }
                Ok(out)
            }
            ExportFormat::Json => {
                let entries = read_segments(&segments)?;
                Ok(serde_json::to_vec_pretty(&entries)?)
            }
        }
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> u64 {
        self.state().next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index:05}{SEGMENT_SUFFIX}"))
}

/// Start a new segment. The chain itself just keeps going: the first entry
/// of the new segment carries the last hash of the previous one.
fn rotate(state: &mut ChainState) -> Result<()> {
    let next_index = state.segment_index + 1;
    let path = segment_path(&state.dir, next_index);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!(
        segment_index = next_index,
        path = %path.display(),
        "Audit log segment rotated"
    );
    state.file = file;
    state.segment_index = next_index;
    state.segment_bytes = 0;
    Ok(())
}

fn list_segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().to_string();
        if let Some(stem) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
        {
            let index: u32 = stem
                .parse()
                .map_err(|_| AuditError::Malformed(format!("unexpected segment name: {name}")))?;
            segments.push((index, dirent.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

fn read_segments(segments: &[(u32, PathBuf)]) -> Result<Vec<AuditLogEntry>> {
    let mut entries = Vec::new();
    for (_, path) in segments {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditLogEntry = serde_json::from_str(&line).map_err(|e| {
                AuditError::Malformed(format!("{}: {e}", path.display()))
            })?;
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn verify_entries(entries: &[AuditLogEntry]) -> ChainStatus {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 0u64;

    for entry in entries {
        if entry.sequence_no != expected_seq
            || entry.prev_hash != expected_prev
            || entry.recompute_hash() != entry.entry_hash
        {
            return ChainStatus::broken(entry.sequence_no);
        }
        expected_prev = entry.entry_hash.clone();
        expected_seq += 1;
    }

    ChainStatus::valid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(action: &str, result: &str) -> AuditRecord {
        AuditRecord::new(Some("repo-1"), "test", action, result)
    }

    fn open_log(dir: &Path) -> AuditLog {
        AuditLog::open(dir, 64 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_empty_log_is_valid() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path());
        assert!(log.is_empty());
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());
    }

    #[test]
    fn test_append_links_chain() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path());

        let first = log.append(record("backup_attempt", "started")).unwrap();
        let second = log.append(record("backup_completed", "snapshot=abc")).unwrap();

        assert_eq!(first.sequence_no, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.sequence_no, 1);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());
    }

    #[test]
    fn test_tamper_detection_points_at_mutated_entry() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path());
        for i in 0..5 {
            log.append(record("backup_attempt", &format!("attempt={i}"))).unwrap();
        }

        // Mutate entry 2's result field in place, keeping valid JSON.
        let path = segment_path(temp.path(), 0);
        let content = fs::read_to_string(&path).unwrap();
        let mutated: Vec<String> = content
            .lines()
            .map(|line| {
                let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
                if value["sequence_no"] == 2 {
                    value["result"] = serde_json::Value::String("attempt=999".into());
                }
                value.to_string()
            })
            .collect();
        fs::write(&path, mutated.join("\n") + "\n").unwrap();

        let status = log.verify_chain().unwrap();
        assert!(!status.ok);
        assert_eq!(status.broken_at, Some(2));
    }

    #[test]
    fn test_open_refuses_broken_chain() {
        let temp = TempDir::new().unwrap();
        {
            let log = open_log(temp.path());
            log.append(record("backup_attempt", "started")).unwrap();
            log.append(record("backup_failed", "timeout")).unwrap();
        }

        let path = segment_path(temp.path(), 0);
        let content = fs::read_to_string(&path).unwrap();
        let mutated: Vec<String> = content
            .lines()
            .map(|line| {
                let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
                if value["sequence_no"] == 1 {
                    value["result"] = serde_json::Value::String("ok".into());
                }
                value.to_string()
            })
            .collect();
        fs::write(&path, mutated.join("\n") + "\n").unwrap();

        let err = AuditLog::open(temp.path(), 64 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, AuditError::ChainIntegrity { broken_at: 1 }));
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let temp = TempDir::new().unwrap();
        let first_hash = {
            let log = open_log(temp.path());
            log.append(record("backup_attempt", "started")).unwrap().entry_hash
        };

        let log = open_log(temp.path());
        let next = log.append(record("backup_completed", "snapshot=xyz")).unwrap();
        assert_eq!(next.sequence_no, 1);
        assert_eq!(next.prev_hash, first_hash);
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());
    }

    #[test]
    fn test_rotation_preserves_chain() {
        let temp = TempDir::new().unwrap();
        // Tiny segment cap forces a rotation on every append after the first.
        let log = AuditLog::open(temp.path(), 64).unwrap();
        for i in 0..6 {
            log.append(record("backup_attempt", &format!("attempt={i}"))).unwrap();
        }

        let segments = list_segments(temp.path()).unwrap();
        assert!(segments.len() > 1, "expected multiple segments");
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());

        // Reopen walks all segments and keeps the sequence going.
        drop(log);
        let log = open_log(temp.path());
        assert_eq!(log.len(), 6);
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());
    }

    #[test]
    fn test_export_jsonl_is_verbatim() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path());
        log.append(record("retention_sweep", "pruned=3")).unwrap();

        let exported = log.export(ExportFormat::Jsonl).unwrap();
        let on_disk = fs::read(segment_path(temp.path(), 0)).unwrap();
        assert_eq!(exported, on_disk);
    }

    #[test]
    fn test_export_json_array() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path());
        log.append(record("backup_completed", "snapshot=a")).unwrap();
        log.append(record("backup_completed", "snapshot=b")).unwrap();

        let exported = log.export(ExportFormat::Json).unwrap();
        let entries: Vec<AuditLogEntry> = serde_json::from_slice(&exported).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].result, "snapshot=b");
    }

    #[test]
    fn test_concurrent_appends_are_strictly_sequenced() {
        let temp = TempDir::new().unwrap();
        let log = std::sync::Arc::new(open_log(temp.path()));

        let mut handles = Vec::new();
        for t in 0..4 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    log.append(AuditRecord::new(
                        None,
                        format!("writer-{t}"),
                        "backup_attempt",
                        format!("attempt={i}"),
                    ))
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 40);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence_no, i as u64);
        }
        assert_eq!(log.verify_chain().unwrap(), ChainStatus::valid());
    }
}
