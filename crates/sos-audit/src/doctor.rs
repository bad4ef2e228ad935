//! Deterministic audit-chain doctor.
//!
//! Exactly two repairs exist, both behind explicit flags: rebuilding the
//! derived receipts index, and truncating a broken file after its first break
//! (which additionally requires `--i-understand`). Every other repair request
//! is refused and recorded in the report.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use sos_chain::{chains, io};
use sos_config::paths;

use crate::{verify_audit_chain, AuditVerification};

/// Requested doctor actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoctorOptions {
    pub diagnose_only: bool,
    pub repair_index_only: bool,
    pub truncate_after_break: bool,
    pub rebuild_missing_prev_links: bool,
    pub i_understand: bool,
}

/// Doctor report plus the exit disposition.
#[derive(Debug, Clone)]
pub struct DoctorOutcome {
    pub status: String,
    pub payload: Value,
    pub report_path: String,
    /// False when a refused repair was requested or truncation left the
    /// chain broken.
    pub success: bool,
}

/// Run the doctor against the repository's audit logs.
pub fn run_doctor(root: &Path, options: DoctorOptions) -> Result<DoctorOutcome, sos_chain::ChainError> {
    let before = verify_audit_chain(root, None);
    let mut actions: Vec<Value> = Vec::new();
    let mut refused: Vec<String> = Vec::new();

    if options.repair_index_only {
        actions.push(rebuild_receipts_index(root)?);
    }

    if options.rebuild_missing_prev_links {
        refused.push(
            "rebuild_missing_prev_links_refused: insufficient deterministic source metadata"
                .to_string(),
        );
    }

    let mut truncation_refused = false;
    if options.truncate_after_break {
        if !options.i_understand {
            refused.push("truncate_after_break_refused: requires --i-understand".to_string());
            truncation_refused = true;
        } else if let Some(first_break) = &before.first_break {
            actions.push(truncate_after_break(
                root,
                &first_break.path,
                first_break.line_number,
            )?);
        } else {
            refused.push("truncate_after_break_refused: no break detected".to_string());
        }
    }

    let after = verify_audit_chain(root, None);
    let status = if !actions.is_empty() {
        "repaired"
    } else if !refused.is_empty() {
        "needs_decision"
    } else {
        "diagnosed"
    };

    let mut payload = json!({
        "schema_version": 1,
        "created_at": iso_now(),
        "status": status,
        "before": before.to_value(),
        "after": after.to_value(),
        "actions": actions,
        "refused": refused,
    });
    let report_path = write_doctor_report(root, &payload)?;
    payload["report_path"] = json!(report_path);
    info!(status, report = %report_path, "audit chain doctor finished");

    let success = !truncation_refused && refused_repairs_ok(&payload) && truncation_ok(&options, &after);
    Ok(DoctorOutcome {
        status: status.to_string(),
        payload,
        report_path,
        success,
    })
}

/// A requested-but-refused repair is a failure disposition.
fn refused_repairs_ok(payload: &Value) -> bool {
    payload["refused"]
        .as_array()
        .map(|items| items.is_empty())
        .unwrap_or(true)
}

fn truncation_ok(options: &DoctorOptions, after: &AuditVerification) -> bool {
    if options.truncate_after_break {
        after.ok()
    } else {
        true
    }
}

/// Rebuild the derived receipts index from primary receipt files.
fn rebuild_receipts_index(root: &Path) -> Result<Value, sos_chain::ChainError> {
    let index_path = root.join(paths::RECEIPTS_INDEX);
    let before = io::sha256_file(&index_path).unwrap_or_default();
    let rows = chains::receipts(root).rebuild_index()?;
    let after = io::sha256_file(&index_path).unwrap_or_default();
    Ok(json!({
        "kind": "repair_index_only",
        "path": paths::RECEIPTS_INDEX,
        "sha_before": before,
        "sha_after": after,
        "row_count": rows.len(),
    }))
}

/// Keep everything before the break line, drop the rest.
fn truncate_after_break(
    root: &Path,
    break_rel_path: &str,
    break_line: usize,
) -> Result<Value, sos_chain::ChainError> {
    let target = root.join(break_rel_path);
    let before = io::sha256_file(&target).unwrap_or_default();
    let text = std::fs::read_to_string(&target)?;
    let kept: Vec<&str> = text
        .lines()
        .take(break_line.saturating_sub(1))
        .collect();
    let mut body = kept.join("\n");
    if !kept.is_empty() {
        body.push('\n');
    }
    std::fs::write(&target, body)?;
    let after = io::sha256_file(&target).unwrap_or_default();
    Ok(json!({
        "kind": "truncate_after_break",
        "path": break_rel_path,
        "lines_kept": kept.len(),
        "sha_before": before,
        "sha_after": after,
    }))
}

fn write_doctor_report(root: &Path, payload: &Value) -> Result<String, sos_chain::ChainError> {
    let tag = Utc::now().format("%Y%m%dT%H%M%SZ");
    let rel = PathBuf::from(paths::AUDIT_REPORTS_DIR).join(format!("audit_doctor_{tag}.json"));
    io::write_json_atomic(&root.join(&rel), payload)?;
    Ok(rel.to_string_lossy().to_string())
}

fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_audit_entry;

    fn seed_broken_log(root: &Path) -> PathBuf {
        let log = root.join("logs/audit.jsonl");
        for n in 0..4 {
            append_audit_entry(
                &log,
                &format!("2026-01-01T00:00:0{n}Z"),
                &json!({"event": "merge", "n": n}),
            )
            .unwrap();
        }
        let text = std::fs::read_to_string(&log).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut row: Value = serde_json::from_str(&lines[2]).unwrap();
        row["data"]["n"] = json!(99);
        lines[2] = serde_json::to_string(&row).unwrap();
        std::fs::write(&log, lines.join("\n") + "\n").unwrap();
        log
    }

    #[test]
    fn diagnose_only_never_mutates() {
        let dir = tempfile::tempdir().unwrap();
        let log = seed_broken_log(dir.path());
        let before = std::fs::read_to_string(&log).unwrap();
        let outcome = run_doctor(dir.path(), DoctorOptions { diagnose_only: true, ..Default::default() }).unwrap();
        assert_eq!(outcome.status, "diagnosed");
        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), before);
    }

    #[test]
    fn truncation_requires_consent() {
        let dir = tempfile::tempdir().unwrap();
        seed_broken_log(dir.path());
        let outcome = run_doctor(
            dir.path(),
            DoctorOptions { truncate_after_break: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(outcome.status, "needs_decision");
        assert!(!outcome.success);
    }

    #[test]
    fn consented_truncation_repairs_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = seed_broken_log(dir.path());
        let outcome = run_doctor(
            dir.path(),
            DoctorOptions {
                truncate_after_break: true,
                i_understand: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.status, "repaired");
        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
        assert!(verify_audit_chain(dir.path(), None).ok());
    }

    #[test]
    fn unsupported_repairs_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        seed_broken_log(dir.path());
        let outcome = run_doctor(
            dir.path(),
            DoctorOptions { rebuild_missing_prev_links: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(outcome.status, "needs_decision");
        assert!(!outcome.success);
        assert_eq!(outcome.payload["refused"].as_array().unwrap().len(), 1);
    }
}
