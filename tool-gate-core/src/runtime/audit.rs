// tool-gate-core/src/runtime/audit.rs
// ============================================================================
// Module: Hash-Chained Audit Log
// Description: Append-only, tamper-evident record of decisions and governance.
// Purpose: Chain every entry to its predecessor and persist the head atomically.
// Dependencies: serde, serde_jcs, sha2 (via hashing)
// ============================================================================

//! ## Overview
//! Every decision outcome and governance event appends one entry carrying
//! `prev_hash` (the chain head) and its own
//! `hash = SHA-256(prev_hash ∥ canonical_json(record))`. Appends serialize
//! through one mutex per log, and the file-backed log writes the entry and
//! advances the head inside that critical section so a crash cannot fork the
//! chain. The chain is verifiable offline by recomputing hashes in order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::Clock;
use crate::core::RequestId;
use crate::core::RuleName;
use crate::core::SubjectId;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::ToolName;
use crate::hashing::HashError;
use crate::hashing::chain_hash;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Chain head before the first entry.
pub const GENESIS_HASH: &str = "0";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Audit log failures. Audit is never best-effort: callers fail the request
/// closed when an append errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Log file I/O failure.
    #[error("audit log io error: {0}")]
    Io(String),
    /// Stored entry could not be parsed.
    #[error("audit log parse error: {0}")]
    Parse(String),
    /// Canonicalization failure while hashing.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Interior lock poisoned by a panicked writer.
    #[error("audit log lock poisoned")]
    LockPoisoned,
    /// Chain verification found a break.
    #[error("audit chain broken at entry {id}: {message}")]
    ChainBroken {
        /// Entry id where verification failed.
        id: u64,
        /// What did not line up.
        message: String,
    },
}

// ============================================================================
// SECTION: Audit Records
// ============================================================================

/// Hashed fields of one audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic id within this log.
    pub id: u64,
    /// Append instant.
    pub ts: Timestamp,
    /// Tenant the event belongs to.
    pub tenant: TenantId,
    /// Subject that triggered the event.
    pub subject: SubjectId,
    /// Tool involved, when the event concerns a tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolName>,
    /// Event label: a decision outcome (`allow`, `deny`,
    /// `approval_requested`, `rate_limited`, `budget_exceeded`) or a
    /// governance event (`approval_decision`, `approval_resolved`,
    /// `bundle_applied`, `bundle_apply_failed`, `rbac_changed`,
    /// `quota_changed`).
    pub event: String,
    /// Winning rule, when a policy decision produced the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleName>,
    /// Canonical digest of the call arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_digest: Option<String>,
    /// Structured event metadata.
    pub result_meta: Value,
    /// Approver id for approval events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<SubjectId>,
    /// JSON-RPC request id, recorded so operators can spot retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// Append input: an [`AuditRecord`] minus the log-assigned id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    /// Tenant the event belongs to.
    pub tenant: TenantId,
    /// Subject that triggered the event.
    pub subject: SubjectId,
    /// Tool involved, if any.
    pub tool: Option<ToolName>,
    /// Event label.
    pub event: String,
    /// Winning rule, if any.
    pub rule: Option<RuleName>,
    /// Canonical digest of the call arguments.
    pub args_digest: Option<String>,
    /// Structured event metadata.
    pub result_meta: Value,
    /// Approver id for approval events.
    pub approver: Option<SubjectId>,
    /// JSON-RPC request id.
    pub request_id: Option<RequestId>,
}

impl AuditDraft {
    /// Creates a minimal draft for the given event.
    #[must_use]
    pub fn new(tenant: TenantId, subject: SubjectId, event: impl Into<String>) -> Self {
        Self {
            tenant,
            subject,
            tool: None,
            event: event.into(),
            rule: None,
            args_digest: None,
            result_meta: Value::Null,
            approver: None,
            request_id: None,
        }
    }

    /// Attaches the tool name.
    #[must_use]
    pub fn with_tool(mut self, tool: ToolName) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Attaches the winning rule.
    #[must_use]
    pub fn with_rule(mut self, rule: Option<RuleName>) -> Self {
        self.rule = rule;
        self
    }

    /// Attaches the argument digest.
    #[must_use]
    pub fn with_args_digest(mut self, digest: String) -> Self {
        self.args_digest = Some(digest);
        self
    }

    /// Attaches structured metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.result_meta = meta;
        self
    }

    /// Attaches the approver id.
    #[must_use]
    pub fn with_approver(mut self, approver: SubjectId) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Attaches the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Finalizes into a record with log-assigned id and timestamp.
    fn into_record(self, id: u64, ts: Timestamp) -> AuditRecord {
        AuditRecord {
            id,
            ts,
            tenant: self.tenant,
            subject: self.subject,
            tool: self.tool,
            event: self.event,
            rule: self.rule,
            args_digest: self.args_digest,
            result_meta: self.result_meta,
            approver: self.approver,
            request_id: self.request_id,
        }
    }
}

/// One chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Hashed record fields.
    pub record: AuditRecord,
    /// Chain head before this entry.
    pub prev_hash: String,
    /// `SHA-256(prev_hash ∥ canonical_json(record))`.
    pub hash: String,
}

// ============================================================================
// SECTION: Audit Log Trait
// ============================================================================

/// Append-only audit log with range export.
pub trait AuditLog: Send + Sync {
    /// Appends one entry, advancing the chain head atomically.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when hashing or persistence fails; callers must
    /// fail the surrounding request closed.
    fn append(&self, draft: AuditDraft) -> Result<AuditEntry, AuditError>;

    /// Exports entries whose timestamps fall in `[frm, to]`, in chain order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the log cannot be read.
    fn export(&self, frm: Timestamp, to: Timestamp) -> Result<Vec<AuditEntry>, AuditError>;

    /// Returns the current chain head.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the log cannot be read.
    fn head(&self) -> Result<String, AuditError>;
}

/// Verifies a chain segment starting from the given head.
///
/// # Errors
///
/// Returns [`AuditError::ChainBroken`] at the first entry whose linkage or
/// hash does not recompute.
pub fn verify_chain(start_hash: &str, entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = start_hash.to_string();
    for entry in entries {
        if entry.prev_hash != prev {
            return Err(AuditError::ChainBroken {
                id: entry.record.id,
                message: format!("prev_hash {} != head {prev}", entry.prev_hash),
            });
        }
        let expected = chain_hash(&entry.prev_hash, &entry.record)?;
        if entry.hash != expected {
            return Err(AuditError::ChainBroken {
                id: entry.record.id,
                message: "hash does not recompute".to_string(),
            });
        }
        prev = entry.hash.clone();
    }
    Ok(())
}

// ============================================================================
// SECTION: In-Memory Log
// ============================================================================

/// Interior state of the in-memory log.
struct MemoryState {
    /// All entries in append order.
    entries: Vec<AuditEntry>,
    /// Current chain head.
    head: String,
}

/// In-memory audit log for tests and single-process runs.
pub struct InMemoryAuditLog {
    /// Entries and head under one writer lock.
    state: Mutex<MemoryState>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl InMemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: Vec::new(),
                head: GENESIS_HASH.to_string(),
            }),
            clock,
        }
    }

    /// Returns a copy of every entry, in chain order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::LockPoisoned`] when the lock is poisoned.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.state.lock().map_err(|_| AuditError::LockPoisoned)?.entries.clone())
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, draft: AuditDraft) -> Result<AuditEntry, AuditError> {
        let mut state = self.state.lock().map_err(|_| AuditError::LockPoisoned)?;
        let record = draft.into_record(state.entries.len() as u64, self.clock.now());
        let prev_hash = state.head.clone();
        let hash = chain_hash(&prev_hash, &record)?;
        let entry = AuditEntry {
            record,
            prev_hash,
            hash: hash.clone(),
        };
        state.entries.push(entry.clone());
        state.head = hash;
        Ok(entry)
    }

    fn export(&self, frm: Timestamp, to: Timestamp) -> Result<Vec<AuditEntry>, AuditError> {
        let state = self.state.lock().map_err(|_| AuditError::LockPoisoned)?;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.record.ts >= frm && entry.record.ts <= to)
            .cloned()
            .collect())
    }

    fn head(&self) -> Result<String, AuditError> {
        Ok(self.state.lock().map_err(|_| AuditError::LockPoisoned)?.head.clone())
    }
}

// ============================================================================
// SECTION: File-Backed Log
// ============================================================================

/// Interior state of the file-backed log. File handle, head, and next id sit
/// under one mutex so the entry and the new head persist together.
struct FileState {
    /// Open append handle.
    file: File,
    /// Current chain head.
    head: String,
    /// Next entry id.
    next_id: u64,
}

/// JSONL audit log with the chain head recovered from the tail on open.
pub struct FileAuditLog {
    /// Guarded file handle and chain head.
    state: Mutex<FileState>,
    /// Log path, for export re-reads.
    path: PathBuf,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl FileAuditLog {
    /// Opens or creates a log file, recovering the chain head and next id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the file cannot be opened or an existing
    /// line cannot be parsed.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let (head, next_id) = Self::load_tail(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AuditError::Io(err.to_string()))?;
        Ok(Self {
            state: Mutex::new(FileState {
                file,
                head,
                next_id,
            }),
            path: path.to_path_buf(),
            clock,
        })
    }

    /// Reads the last hash and entry count from an existing log.
    fn load_tail(path: &Path) -> Result<(String, u64), AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| AuditError::Io(err.to_string()))?;
        let reader = BufReader::new(file);
        let mut head = GENESIS_HASH.to_string();
        let mut count = 0u64;
        for line in reader.lines() {
            let line = line.map_err(|err| AuditError::Io(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry =
                serde_json::from_str(&line).map_err(|err| AuditError::Parse(err.to_string()))?;
            head = entry.hash;
            count += 1;
        }
        Ok((head, count))
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, draft: AuditDraft) -> Result<AuditEntry, AuditError> {
        let mut state = self.state.lock().map_err(|_| AuditError::LockPoisoned)?;
        let record = draft.into_record(state.next_id, self.clock.now());
        let prev_hash = state.head.clone();
        let hash = chain_hash(&prev_hash, &record)?;
        let entry = AuditEntry {
            record,
            prev_hash,
            hash: hash.clone(),
        };
        let line =
            serde_json::to_string(&entry).map_err(|err| AuditError::Parse(err.to_string()))?;
        writeln!(state.file, "{line}").map_err(|err| AuditError::Io(err.to_string()))?;
        state.file.flush().map_err(|err| AuditError::Io(err.to_string()))?;
        // Head and id advance only after the entry is durable.
        state.head = hash;
        state.next_id += 1;
        Ok(entry)
    }

    fn export(&self, frm: Timestamp, to: Timestamp) -> Result<Vec<AuditEntry>, AuditError> {
        // Hold the writer lock so a concurrent append cannot tear the read.
        let _guard = self.state.lock().map_err(|_| AuditError::LockPoisoned)?;
        let file = File::open(&self.path).map_err(|err| AuditError::Io(err.to_string()))?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|err| AuditError::Io(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry =
                serde_json::from_str(&line).map_err(|err| AuditError::Parse(err.to_string()))?;
            if entry.record.ts >= frm && entry.record.ts <= to {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn head(&self) -> Result<String, AuditError> {
        Ok(self.state.lock().map_err(|_| AuditError::LockPoisoned)?.head.clone())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

    use std::sync::Arc;

    use serde_json::json;

    use super::AuditDraft;
    use super::AuditLog;
    use super::FileAuditLog;
    use super::GENESIS_HASH;
    use super::InMemoryAuditLog;
    use super::verify_chain;
    use crate::core::ManualClock;
    use crate::core::Timestamp;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(Timestamp::from_secs(1_754_092_800)))
    }

    fn draft(event: &str) -> AuditDraft {
        AuditDraft::new("acme".into(), "agent-7".into(), event)
            .with_tool("net.http".into())
            .with_meta(json!({"detail": event}))
    }

    #[test]
    fn entries_link_and_verify() {
        let log = InMemoryAuditLog::new(clock());
        log.append(draft("allow")).unwrap();
        log.append(draft("deny")).unwrap();
        log.append(draft("approval_requested")).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
        verify_chain(GENESIS_HASH, &entries).unwrap();
    }

    #[test]
    fn tampered_entry_breaks_verification() {
        let log = InMemoryAuditLog::new(clock());
        log.append(draft("allow")).unwrap();
        log.append(draft("deny")).unwrap();
        let mut entries = log.entries().unwrap();
        entries[0].record.event = "allow_evil".to_string();
        let err = verify_chain(GENESIS_HASH, &entries).unwrap_err();
        assert!(err.to_string().contains("does not recompute"), "unexpected error {err}");
    }

    #[test]
    fn export_filters_by_time_range() {
        let manual = clock();
        let log = InMemoryAuditLog::new(manual.clone());
        log.append(draft("allow")).unwrap();
        manual.advance_millis(10_000);
        log.append(draft("deny")).unwrap();
        let frm = Timestamp::from_secs(1_754_092_800 + 5);
        let to = Timestamp::from_secs(1_754_092_800 + 60);
        let exported = log.export(frm, to).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].record.event, "deny");
    }

    #[test]
    fn file_log_recovers_head_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let head = {
            let log = FileAuditLog::open(&path, clock()).unwrap();
            log.append(draft("allow")).unwrap();
            log.append(draft("deny")).unwrap();
            log.head().unwrap()
        };
        let log = FileAuditLog::open(&path, clock()).unwrap();
        assert_eq!(log.head().unwrap(), head);
        let entry = log.append(draft("approval_requested")).unwrap();
        assert_eq!(entry.prev_hash, head);
        assert_eq!(entry.record.id, 2);
        let exported = log.export(Timestamp::from_millis(0), Timestamp::from_millis(i64::MAX)).unwrap();
        verify_chain(GENESIS_HASH, &exported).unwrap();
    }

    #[test]
    fn concurrent_appends_keep_chain_integrity() {
        let log = Arc::new(InMemoryAuditLog::new(clock()));
        let mut handles = Vec::new();
        for n in 0..8 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                for k in 0..16 {
                    log.append(draft(&format!("event-{n}-{k}"))).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 128);
        verify_chain(GENESIS_HASH, &entries).unwrap();
    }
}
