//! Audit-chain gate wrapper: env-driven severity plus report persistence.

use std::path::Path;

use sos_audit::{verify_audit_chain, write_report, AuditVerification};
use sos_config::Env;

use crate::CoreError;

/// `(result, fail, warn, report_rel_path)`; `None` result when disabled.
pub fn maybe_verify_audit_chain(
    root: &Path,
    env: &Env,
) -> Result<(Option<AuditVerification>, bool, bool, Option<String>), CoreError> {
    let enforce = env.flag("SENTIENTOS_AUDIT_CHAIN_ENFORCE");
    let warn = env.flag("SENTIENTOS_AUDIT_CHAIN_WARN");
    if !enforce && !warn {
        return Ok((None, false, false, None));
    }
    let result = verify_audit_chain(root, None);
    let report_rel = write_report(root, &result)?.to_string_lossy().to_string();
    let not_ok = !result.ok() && result.status != "unknown";
    Ok((
        Some(result),
        enforce && not_ok,
        warn && !enforce && not_ok,
        Some(report_rel),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sos_audit::append_audit_entry;

    #[test]
    fn disabled_gate_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let (result, fail, warn, report) =
            maybe_verify_audit_chain(dir.path(), &Env::default()).unwrap();
        assert!(result.is_none());
        assert!(!fail && !warn);
        assert!(report.is_none());
    }

    #[test]
    fn enabled_gate_writes_a_report() {
        let dir = tempfile::tempdir().unwrap();
        append_audit_entry(
            &dir.path().join("logs/audit.jsonl"),
            "2026-01-01T00:00:00Z",
            &json!({"event": "merge"}),
        )
        .unwrap();
        let env = Env::from_pairs([("SENTIENTOS_AUDIT_CHAIN_WARN", "1")]);
        let (result, fail, warn, report) = maybe_verify_audit_chain(dir.path(), &env).unwrap();
        assert!(result.unwrap().ok());
        assert!(!fail && !warn);
        assert!(dir.path().join(report.unwrap()).exists());
    }
}
