//! Generic append-only hash-chained log.
//!
//! Each chain lives in one directory: a set of one-JSON-object-per-file
//! primary entries plus a derived JSONL index. Primary entries are the source
//! of truth; the index is rebuildable at any time via [`HashChain::rebuild_index`].
//! A single writer per chain is enforced with an advisory lock on
//! `<dir>/.lock`; readers take no lock.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::debug;

use sos_enc::{compute_chained_hash, hash_payload_without, EncError, HASH_ALGO};

pub mod chains;
pub mod io;
pub mod lock;

pub use lock::FileLock;

/// Chain-layer error. Tags mirror the substrate's machine-readable reasons.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad_json: {0}")]
    BadJson(String),
    #[error("tmp_rename_failed")]
    TmpRenameFailed,
    #[error("entry payload must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Enc(#[from] EncError),
}

/// How the first entry of a chain records its missing predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenesisMode {
    /// `prev` field is JSON `null` (receipts).
    NullPrev,
    /// `prev` field holds the literal `"GENESIS"` marker (governor, provenance).
    Marker,
}

/// Which hash rule the chain applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVariant {
    /// Hash the canonical payload with the prev link embedded and only the
    /// hash field stripped (receipts).
    PayloadWithoutHashField,
    /// `(prev or GENESIS) || "\n" || canonical(payload without hash fields)`
    /// with `hash_algo` recorded (anchors, governor snapshots, provenance).
    ChainedMarker,
}

/// Static description of one chain, fixed at creation.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub index_name: String,
    pub id_field: String,
    pub created_at_field: String,
    pub hash_field: String,
    pub prev_field: String,
    pub genesis: GenesisMode,
    pub variant: HashVariant,
    /// Domain fields copied into each derived index row.
    pub index_fields: Vec<String>,
}

impl ChainConfig {
    fn index_path(&self) -> PathBuf {
        self.dir.join(&self.index_name)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }
}

/// Reason a chain walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakReason {
    HashMissing,
    HashMismatch,
    PrevMismatch,
    AlgoMismatch,
    BadJson,
}

impl BreakReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            BreakReason::HashMissing => "hash_missing",
            BreakReason::HashMismatch => "hash_mismatch",
            BreakReason::PrevMismatch => "prev_mismatch",
            BreakReason::AlgoMismatch => "algo_mismatch",
            BreakReason::BadJson => "bad_json",
        }
    }
}

/// First break found during verification.
#[derive(Debug, Clone)]
pub struct ChainBreak {
    pub id: String,
    pub reason: BreakReason,
    pub expected: Option<String>,
    pub found: Option<String>,
}

/// Outcome of walking a chain.
#[derive(Debug, Clone)]
pub struct Verification {
    pub status: VerificationStatus,
    pub checked_count: usize,
    pub break_info: Option<ChainBreak>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Ok,
    Broken,
    /// Empty chain. Callers treat this as non-failing.
    Unknown,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Ok => "ok",
            VerificationStatus::Broken => "broken",
            VerificationStatus::Unknown => "unknown",
        }
    }
}

impl Verification {
    pub fn ok(&self) -> bool {
        self.status == VerificationStatus::Ok
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "status": self.status.as_str(),
            "checked_count": self.checked_count,
        });
        if let Some(break_info) = &self.break_info {
            payload["break"] = json!({
                "id": break_info.id,
                "reason": break_info.reason.as_tag(),
                "expected": break_info.expected,
                "found": break_info.found,
            });
        }
        payload
    }
}

/// One append-only hash chain rooted at a directory.
#[derive(Debug, Clone)]
pub struct HashChain {
    config: ChainConfig,
}

impl HashChain {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Append a new entry. The payload must not yet carry hash fields.
    ///
    /// Holds the chain's writer lock across tip resolution, the primary-file
    /// write, and the index append so concurrent appenders serialize.
    pub fn append(&self, payload: Value) -> Result<Value, ChainError> {
        if !payload.is_object() {
            return Err(ChainError::NotAnObject);
        }
        std::fs::create_dir_all(&self.config.dir)?;
        let _guard = FileLock::acquire_blocking(&self.config.lock_path())?;

        let prev_hash = self.tip_hash();
        let mut entry = payload;
        {
            let object = entry.as_object_mut().expect("checked above");
            match (&self.config.genesis, &prev_hash) {
                (_, Some(prev)) => {
                    object.insert(self.config.prev_field.clone(), json!(prev));
                }
                (GenesisMode::NullPrev, None) => {
                    object.insert(self.config.prev_field.clone(), Value::Null);
                }
                (GenesisMode::Marker, None) => {
                    object.insert(self.config.prev_field.clone(), json!(sos_enc::GENESIS_MARKER));
                }
            }
            if self.config.variant == HashVariant::ChainedMarker {
                object.insert("hash_algo".to_string(), json!(HASH_ALGO));
            }
        }
        let entry_hash = self.compute_entry_hash(&entry, prev_hash.as_deref())?;
        entry
            .as_object_mut()
            .expect("checked above")
            .insert(self.config.hash_field.clone(), json!(entry_hash));

        let entry_path = self.config.dir.join(self.entry_file_name(&entry));
        io::write_json_atomic(&entry_path, &entry)?;
        io::append_jsonl(&self.config.index_path(), &self.index_row(&entry))?;
        debug!(chain = %self.config.dir.display(), hash = %entry_hash, "appended chain entry");
        Ok(entry)
    }

    /// Hash of the newest entry, from the index when present, else from files.
    pub fn tip_hash(&self) -> Option<String> {
        let rows = io::read_jsonl(&self.config.index_path());
        for row in rows.iter().rev() {
            if let Some(hash) = as_nonempty_str(row.get(&self.config.hash_field)) {
                return Some(hash.to_string());
            }
        }
        self.entries_ordered()
            .into_iter()
            .rev()
            .find_map(|entry| {
                as_nonempty_str(entry.get(&self.config.hash_field)).map(str::to_string)
            })
    }

    /// All parseable entries sorted by `(created_at, id)` ascending.
    pub fn entries_ordered(&self) -> Vec<Value> {
        self.load_files()
            .into_iter()
            .filter_map(|(_, value)| value)
            .collect()
    }

    /// Walk the chain, newest `last` entries when given, stopping at the
    /// first break.
    pub fn verify(&self, last: Option<usize>) -> Verification {
        let records = self.load_files();
        if records.is_empty() {
            return Verification {
                status: VerificationStatus::Unknown,
                checked_count: 0,
                break_info: None,
            };
        }

        let start = match last {
            Some(n) if n > 0 && n < records.len() => records.len() - n,
            _ => 0,
        };
        let mut prior_hash: Option<String> = if start > 0 {
            records[start - 1]
                .1
                .as_ref()
                .and_then(|entry| as_nonempty_str(entry.get(&self.config.hash_field)))
                .map(str::to_string)
        } else {
            None
        };

        for (idx, (name, maybe_entry)) in records.iter().enumerate().skip(start) {
            let checked = idx - start + 1;
            let Some(entry) = maybe_entry else {
                return broken(checked, name.clone(), BreakReason::BadJson, None, None);
            };
            let id = as_nonempty_str(entry.get(&self.config.id_field))
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());

            if self.config.variant == HashVariant::ChainedMarker {
                if let Some(algo) = as_nonempty_str(entry.get("hash_algo")) {
                    if algo != HASH_ALGO {
                        return broken(
                            checked,
                            id,
                            BreakReason::AlgoMismatch,
                            Some(HASH_ALGO.to_string()),
                            Some(algo.to_string()),
                        );
                    }
                }
            }

            let Some(found_hash) = as_nonempty_str(entry.get(&self.config.hash_field)) else {
                return broken(checked, id, BreakReason::HashMissing, None, None);
            };

            let found_prev = self.entry_prev(entry);
            let expected_prev = prior_hash.clone();
            if found_prev != expected_prev {
                return broken(checked, id, BreakReason::PrevMismatch, expected_prev, found_prev);
            }

            let expected_hash = match self.compute_entry_hash(entry, expected_prev.as_deref()) {
                Ok(hash) => hash,
                Err(_) => {
                    return broken(checked, id, BreakReason::BadJson, None, None);
                }
            };
            if expected_hash != found_hash {
                return broken(
                    checked,
                    id,
                    BreakReason::HashMismatch,
                    Some(expected_hash),
                    Some(found_hash.to_string()),
                );
            }
            prior_hash = Some(found_hash.to_string());
        }

        Verification {
            status: VerificationStatus::Ok,
            checked_count: records.len() - start,
            break_info: None,
        }
    }

    /// Re-derive the index from primary entries. Never rewrites entries.
    pub fn rebuild_index(&self) -> Result<Vec<Value>, ChainError> {
        let rows: Vec<Value> = self
            .entries_ordered()
            .iter()
            .map(|entry| self.index_row(entry))
            .collect();
        io::write_jsonl_atomic(&self.config.index_path(), &rows)?;
        Ok(rows)
    }

    fn compute_entry_hash(&self, entry: &Value, prev: Option<&str>) -> Result<String, ChainError> {
        let hash = match self.config.variant {
            HashVariant::PayloadWithoutHashField => {
                hash_payload_without(entry, &[self.config.hash_field.as_str()])?
            }
            HashVariant::ChainedMarker => compute_chained_hash(
                entry,
                prev,
                &[
                    self.config.hash_field.as_str(),
                    self.config.prev_field.as_str(),
                    "hash_algo",
                ],
            )?,
        };
        Ok(hash)
    }

    /// Stored prev link normalized: genesis markers and nulls become `None`.
    fn entry_prev(&self, entry: &Value) -> Option<String> {
        match as_nonempty_str(entry.get(&self.config.prev_field)) {
            Some(sos_enc::GENESIS_MARKER) => None,
            Some(prev) => Some(prev.to_string()),
            None => None,
        }
    }

    fn entry_file_name(&self, entry: &Value) -> String {
        let raw_id = as_nonempty_str(entry.get(&self.config.id_field)).unwrap_or("entry");
        let safe_id: String = raw_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}{}.json", self.config.file_prefix, safe_id)
    }

    fn index_row(&self, entry: &Value) -> Value {
        let mut row = serde_json::Map::new();
        let mut copy = |field: &str| {
            row.insert(
                field.to_string(),
                entry.get(field).cloned().unwrap_or(Value::Null),
            );
        };
        copy(&self.config.id_field);
        copy(&self.config.created_at_field);
        copy(&self.config.hash_field);
        copy(&self.config.prev_field);
        for field in &self.config.index_fields {
            copy(field);
        }
        Value::Object(row)
    }

    /// Entry files in `(created_at, id)` order, parse failures kept as `None`.
    fn load_files(&self) -> Vec<(String, Option<Value>)> {
        let Ok(read_dir) = std::fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read_dir
            .filter_map(Result::ok)
            .filter_map(|dirent| dirent.file_name().into_string().ok())
            .filter(|name| name.starts_with(&self.config.file_prefix) && name.ends_with(".json"))
            .collect();
        names.sort();

        let mut records: Vec<(String, Option<Value>)> = names
            .into_iter()
            .map(|name| {
                let value = read_entry(&self.config.dir.join(&name));
                (name, value)
            })
            .collect();
        records.sort_by(|a, b| {
            let key = |record: &(String, Option<Value>)| {
                let created_at = record
                    .1
                    .as_ref()
                    .and_then(|entry| as_nonempty_str(entry.get(&self.config.created_at_field)))
                    .unwrap_or("")
                    .to_string();
                (created_at, record.0.clone())
            };
            key(a).cmp(&key(b))
        });
        records
    }
}

fn read_entry(path: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<Value>(&text)
        .ok()
        .filter(Value::is_object)
}

fn broken(
    checked_count: usize,
    id: String,
    reason: BreakReason,
    expected: Option<String>,
    found: Option<String>,
) -> Verification {
    Verification {
        status: VerificationStatus::Broken,
        checked_count,
        break_info: Some(ChainBreak {
            id,
            reason,
            expected,
            found,
        }),
    }
}

fn as_nonempty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receipt_chain(dir: &Path) -> HashChain {
        HashChain::new(ChainConfig {
            dir: dir.to_path_buf(),
            file_prefix: "merge_receipt_".to_string(),
            index_name: "receipts_index.jsonl".to_string(),
            id_field: "receipt_id".to_string(),
            created_at_field: "created_at".to_string(),
            hash_field: "receipt_hash".to_string(),
            prev_field: "prev_receipt_hash".to_string(),
            genesis: GenesisMode::NullPrev,
            variant: HashVariant::PayloadWithoutHashField,
            index_fields: vec!["pr_number".to_string(), "head_sha".to_string()],
        })
    }

    fn receipt(id: &str, created_at: &str, head_sha: &str) -> Value {
        json!({
            "schema_version": 2,
            "receipt_id": id,
            "created_at": created_at,
            "pr_number": 1,
            "head_sha": head_sha,
            "gating_result": "merged",
        })
    }

    #[test]
    fn append_links_and_verify_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let chain = receipt_chain(dir.path());

        let first = chain
            .append(receipt("a", "2026-01-01T00:00:00Z", "abc"))
            .unwrap();
        let second = chain
            .append(receipt("b", "2026-01-01T00:00:01Z", "def"))
            .unwrap();

        assert_eq!(first["prev_receipt_hash"], Value::Null);
        assert_eq!(second["prev_receipt_hash"], first["receipt_hash"]);
        assert_eq!(chain.tip_hash().as_deref(), second["receipt_hash"].as_str());

        let verification = chain.verify(None);
        assert_eq!(verification.status, VerificationStatus::Ok);
        assert_eq!(verification.checked_count, 2);
    }

    #[test]
    fn tampered_entry_breaks_with_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let chain = receipt_chain(dir.path());
        chain
            .append(receipt("a", "2026-01-01T00:00:00Z", "abc"))
            .unwrap();
        chain
            .append(receipt("b", "2026-01-01T00:00:01Z", "def"))
            .unwrap();

        let target = dir.path().join("merge_receipt_b.json");
        let mut entry = io::read_json(&target).unwrap();
        entry["head_sha"] = json!("tampered");
        io::write_json_atomic(&target, &entry).unwrap();

        let verification = chain.verify(None);
        assert_eq!(verification.status, VerificationStatus::Broken);
        let break_info = verification.break_info.unwrap();
        assert_eq!(break_info.reason, BreakReason::HashMismatch);
        assert_eq!(break_info.id, "b");
    }

    #[test]
    fn empty_chain_is_unknown_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let chain = receipt_chain(dir.path());
        let verification = chain.verify(Some(25));
        assert_eq!(verification.status, VerificationStatus::Unknown);
        assert_eq!(verification.checked_count, 0);
    }

    #[test]
    fn rebuild_index_is_idempotent_and_recovers_missing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let chain = receipt_chain(dir.path());
        chain
            .append(receipt("a", "2026-01-01T00:00:00Z", "abc"))
            .unwrap();
        chain
            .append(receipt("b", "2026-01-01T00:00:01Z", "def"))
            .unwrap();

        let index_path = dir.path().join("receipts_index.jsonl");
        std::fs::remove_file(&index_path).unwrap();
        let rows = chain.rebuild_index().unwrap();
        assert_eq!(rows.len(), 2);
        let again = chain.rebuild_index().unwrap();
        assert_eq!(rows, again);
        assert_eq!(io::read_jsonl(&index_path).len(), 2);
    }

    #[test]
    fn marker_chain_records_genesis_and_hash_algo() {
        let dir = tempfile::tempdir().unwrap();
        let chain = HashChain::new(ChainConfig {
            dir: dir.path().to_path_buf(),
            file_prefix: "state_".to_string(),
            index_name: "state_index.jsonl".to_string(),
            id_field: "state_id".to_string(),
            created_at_field: "created_at".to_string(),
            hash_field: "state_hash".to_string(),
            prev_field: "prev_state_hash".to_string(),
            genesis: GenesisMode::Marker,
            variant: HashVariant::ChainedMarker,
            index_fields: Vec::new(),
        });

        let first = chain
            .append(json!({"state_id": "s1", "created_at": "2026-01-01T00:00:00Z", "n": 1}))
            .unwrap();
        assert_eq!(first["prev_state_hash"], json!("GENESIS"));
        assert_eq!(first["hash_algo"], json!("sha256"));

        chain
            .append(json!({"state_id": "s2", "created_at": "2026-01-01T00:00:01Z", "n": 2}))
            .unwrap();
        assert!(chain.verify(None).ok());
    }
}
