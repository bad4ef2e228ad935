//! Rolling-hash verification of append-only audit logs.
//!
//! External collaborators append `{timestamp, data, prev_hash, rolling_hash}`
//! rows where `rolling_hash = SHA256(timestamp || canonical(data) || prev_hash)`.
//! Verification walks the configured files in stable order, halts a file at
//! its first break, and restarts the expected chain at the zero hash for the
//! next file after a break.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use sos_chain::io;
use sos_config::paths;
use sos_enc::canonical_bytes;

pub mod doctor;

const SCHEMA_VERSION: u64 = 1;
const MAX_AFFECTED_RANGES: usize = 20;

/// Expected `prev_hash` at the head of a fresh chain.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const REASON_MISSING_PREV_HASH: &str = "missing_prev_hash";
pub const REASON_NON_OBJECT_LINE: &str = "non_object_line";
pub const REASON_ROLLING_HASH_MISMATCH: &str = "rolling_hash_mismatch";
pub const REASON_BAD_JSON: &str = "bad_json";

/// First break found across the audit files.
#[derive(Debug, Clone)]
pub struct AuditFirstBreak {
    pub path: String,
    pub expected_prev_hash: String,
    pub found_prev_hash: String,
    pub line_number: usize,
    pub reason: &'static str,
}

/// Outcome of a full audit-chain walk.
#[derive(Debug, Clone)]
pub struct AuditVerification {
    pub status: String,
    pub created_at: String,
    pub break_count: usize,
    pub checked_files: usize,
    pub first_break: Option<AuditFirstBreak>,
    pub affected_ranges: Vec<Value>,
    pub suggested_actions: Vec<String>,
}

impl AuditVerification {
    pub fn ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": SCHEMA_VERSION,
            "created_at": self.created_at,
            "status": self.status,
            "break_count": self.break_count,
            "checked_files": self.checked_files,
            "first_break": self.first_break.as_ref().map(|fb| json!({
                "path": fb.path,
                "expected_prev_hash": fb.expected_prev_hash,
                "found_prev_hash": fb.found_prev_hash,
                "line_number": fb.line_number,
                "reason": fb.reason,
            })),
            "affected_ranges": self.affected_ranges,
            "suggested_actions": self.suggested_actions,
        })
    }
}

/// `SHA256(timestamp || canonical(data) || prev_hash)` as lowercase hex.
pub fn rolling_hash(timestamp: &str, data: &Value, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(canonical_bytes(data).unwrap_or_default());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append a well-formed audit row to a log file. Producer-side helper used by
/// fixtures and the event plumbing.
pub fn append_audit_entry(
    path: &Path,
    timestamp: &str,
    data: &Value,
) -> Result<Value, sos_chain::ChainError> {
    let prev_hash = last_rolling_hash(path).unwrap_or_else(|| ZERO_HASH.to_string());
    let entry = json!({
        "timestamp": timestamp,
        "data": data,
        "prev_hash": prev_hash,
        "rolling_hash": rolling_hash(timestamp, data, &prev_hash),
    });
    io::append_jsonl(path, &entry)?;
    Ok(entry)
}

fn last_rolling_hash(path: &Path) -> Option<String> {
    io::read_jsonl(path)
        .iter()
        .rev()
        .find_map(|row| row.get("rolling_hash").and_then(Value::as_str))
        .map(str::to_string)
}

/// Audit log files in stable (sorted) order.
pub fn configured_log_paths(root: &Path) -> Vec<PathBuf> {
    let logs_dir = root.join(paths::AUDIT_LOGS_DIR);
    let Ok(read_dir) = std::fs::read_dir(&logs_dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = read_dir
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|ext| ext.to_str()) == Some("jsonl")
                && looks_like_audit_log(path)
        })
        .collect();
    found.sort();
    found
}

fn looks_like_audit_log(path: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let Some(first) = text.lines().find(|line| !line.trim().is_empty()) else {
        return false;
    };
    first.trim_start().starts_with('{') && first.contains("timestamp") && first.contains("data")
}

/// Walk every configured audit file; `paths_override` pins the file set for
/// tests and the doctor.
pub fn verify_audit_chain(root: &Path, paths_override: Option<&[PathBuf]>) -> AuditVerification {
    let files: Vec<PathBuf> = match paths_override {
        Some(paths) => {
            let mut sorted = paths.to_vec();
            sorted.sort();
            sorted
        }
        None => configured_log_paths(root),
    };
    let created_at = iso_now();
    if files.is_empty() {
        return AuditVerification {
            status: "unknown".to_string(),
            created_at,
            break_count: 0,
            checked_files: 0,
            first_break: None,
            affected_ranges: Vec::new(),
            suggested_actions: base_suggestions(false),
        };
    }

    let mut break_count = 0usize;
    let mut first_break: Option<AuditFirstBreak> = None;
    let mut affected_ranges: Vec<Value> = Vec::new();
    let mut expected_prev = ZERO_HASH.to_string();

    for file in &files {
        let rel = file
            .strip_prefix(root)
            .unwrap_or(file.as_path())
            .to_string_lossy()
            .to_string();
        let text = std::fs::read_to_string(file).unwrap_or_default();
        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut file_broke = false;

        for (idx, line) in lines.iter().enumerate() {
            let line_number = idx + 1;
            let mut record_break = |found: String, reason: &'static str| {
                break_count += 1;
                if first_break.is_none() {
                    first_break = Some(AuditFirstBreak {
                        path: rel.clone(),
                        expected_prev_hash: expected_prev.clone(),
                        found_prev_hash: found,
                        line_number,
                        reason,
                    });
                }
                if affected_ranges.len() < MAX_AFFECTED_RANGES {
                    affected_ranges.push(json!({
                        "path": rel,
                        "start_line": line_number,
                        "end_line": lines.len(),
                    }));
                }
            };

            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                record_break("<invalid-json>".to_string(), REASON_BAD_JSON);
                file_broke = true;
                break;
            };
            if !entry.is_object() {
                record_break("<non-object>".to_string(), REASON_NON_OBJECT_LINE);
                file_broke = true;
                break;
            }
            let found_prev = entry
                .get("prev_hash")
                .and_then(Value::as_str)
                .unwrap_or("<missing>")
                .to_string();
            if found_prev != expected_prev {
                record_break(found_prev, REASON_MISSING_PREV_HASH);
                file_broke = true;
                break;
            }
            let timestamp = entry.get("timestamp").and_then(Value::as_str);
            let data = entry.get("data");
            let (Some(timestamp), Some(data)) = (timestamp, data) else {
                record_break(found_prev, REASON_NON_OBJECT_LINE);
                file_broke = true;
                break;
            };
            let expected = rolling_hash(timestamp, data, &expected_prev);
            let current = entry.get("rolling_hash").and_then(Value::as_str);
            if current != Some(expected.as_str()) {
                record_break(found_prev, REASON_ROLLING_HASH_MISMATCH);
                file_broke = true;
                break;
            }
            expected_prev = expected;
        }

        if file_broke {
            // Broken file poisons the carried hash; the next file is judged
            // against a fresh chain head.
            expected_prev = ZERO_HASH.to_string();
        }
    }

    AuditVerification {
        status: if break_count == 0 { "ok" } else { "broken" }.to_string(),
        created_at,
        break_count,
        checked_files: files.len(),
        first_break,
        affected_ranges,
        suggested_actions: base_suggestions(break_count > 0),
    }
}

/// Persist a verification report under the audit reports directory.
pub fn write_report(root: &Path, verification: &AuditVerification) -> Result<PathBuf, sos_chain::ChainError> {
    let tag = Utc::now().format("%Y%m%dT%H%M%SZ");
    let rel = PathBuf::from(paths::AUDIT_REPORTS_DIR).join(format!("audit_chain_report_{tag}.json"));
    io::write_json_atomic(&root.join(&rel), &verification.to_value())?;
    Ok(rel)
}

/// Newest report path, if any.
pub fn latest_report(root: &Path) -> Option<PathBuf> {
    let reports_dir = root.join(paths::AUDIT_REPORTS_DIR);
    let mut names: Vec<String> = std::fs::read_dir(&reports_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("audit_chain_report_") && name.ends_with(".json"))
        .collect();
    names.sort();
    names.pop().map(|name| reports_dir.join(name))
}

fn base_suggestions(broken: bool) -> Vec<String> {
    let mut suggestions = vec![
        "forge audit-chain-doctor --repair-index-only".to_string(),
    ];
    if broken {
        suggestions.push("forge audit-chain-doctor --diagnose-only".to_string());
    }
    suggestions
}

fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed_log(path: &Path, entries: usize) {
        for n in 0..entries {
            append_audit_entry(
                path,
                &format!("2026-01-01T00:00:0{n}Z"),
                &json!({"event": "merge", "n": n}),
            )
            .unwrap();
        }
    }

    #[test]
    fn intact_log_verifies_ok() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/audit.jsonl");
        seed_log(&log, 4);
        let verification = verify_audit_chain(dir.path(), None);
        assert_eq!(verification.status, "ok");
        assert_eq!(verification.checked_files, 1);
        assert_eq!(verification.break_count, 0);
    }

    #[test]
    fn empty_log_set_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let verification = verify_audit_chain(dir.path(), None);
        assert_eq!(verification.status, "unknown");
        assert_eq!(verification.checked_files, 0);
    }

    #[test]
    fn tampered_line_breaks_with_rolling_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/audit.jsonl");
        seed_log(&log, 3);

        let text = std::fs::read_to_string(&log).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut row: Value = serde_json::from_str(&lines[1]).unwrap();
        row["data"]["event"] = json!("tampered");
        lines[1] = serde_json::to_string(&row).unwrap();
        std::fs::write(&log, lines.join("\n") + "\n").unwrap();

        let verification = verify_audit_chain(dir.path(), None);
        assert_eq!(verification.status, "broken");
        let first_break = verification.first_break.unwrap();
        assert_eq!(first_break.line_number, 2);
        assert_eq!(first_break.reason, REASON_ROLLING_HASH_MISMATCH);
        assert_eq!(verification.affected_ranges.len(), 1);
    }

    #[test]
    fn chain_links_across_files_and_resets_after_break() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("logs/audit_a.jsonl");
        seed_log(&first, 2);
        let carried = last_rolling_hash(&first).unwrap();

        // Second file continues from the first file's final hash.
        let second = dir.path().join("logs/audit_b.jsonl");
        let entry = json!({
            "timestamp": "2026-01-02T00:00:00Z",
            "data": {"event": "merge"},
            "prev_hash": carried,
            "rolling_hash": rolling_hash("2026-01-02T00:00:00Z", &json!({"event": "merge"}), &carried),
        });
        io::append_jsonl(&second, &entry).unwrap();
        assert_eq!(verify_audit_chain(dir.path(), None).status, "ok");

        // Break the first file; the second now mismatches the reset chain head.
        std::fs::write(&first, "garbage\n").unwrap();
        let verification = verify_audit_chain(dir.path(), None);
        assert_eq!(verification.status, "broken");
        assert_eq!(verification.break_count, 2);
        assert_eq!(verification.first_break.unwrap().reason, REASON_BAD_JSON);
    }
}
