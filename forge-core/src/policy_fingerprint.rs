//! Policy fingerprint: a canonical snapshot of the effective configuration.
//!
//! The fingerprint hash binds each integrity status and attestation snapshot
//! to the configuration that produced it.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use sos_chain::io;
use sos_config::{paths, Env};
use sos_enc::hash_canonical;

use crate::{iso_now, safe_ts, CoreError};

/// Emitted fingerprint artifact.
#[derive(Debug, Clone)]
pub struct PolicyFingerprint {
    pub ts: String,
    pub policy: Value,
    pub policy_hash: String,
    pub path: String,
}

fn verify_block(env: &Env, prefix: &str) -> Value {
    json!({
        "enabled": env.flag(&format!("{prefix}_VERIFY")),
        "last_n": env.int_or(&format!("{prefix}_VERIFY_LAST_N"), 25),
        "warn": env.flag(&format!("{prefix}_WARN")),
        "enforce": env.flag(&format!("{prefix}_ENFORCE")),
    })
}

/// The policy dictionary the hash is computed over.
pub fn build_policy_dict(env: &Env) -> Value {
    json!({
        "posture": {
            "default": env.str_or("SENTIENTOS_POSTURE", "balanced"),
            "mode_force": env.get("SENTIENTOS_MODE_FORCE"),
            "allow_automerge_override": env.get("SENTIENTOS_MODE_ALLOW_AUTOMERGE"),
            "allow_publish_override": env.get("SENTIENTOS_MODE_ALLOW_PUBLISH"),
        },
        "pressure": {
            "warn_threshold": env.get("SENTIENTOS_PRESSURE_WARN_THRESHOLD"),
            "enforce_threshold": env.get("SENTIENTOS_PRESSURE_ENFORCE_THRESHOLD"),
            "critical_threshold": env.get("SENTIENTOS_PRESSURE_CRITICAL_THRESHOLD"),
            "escalation_disabled": env.flag("SENTIENTOS_PRESSURE_DISABLE_ESCALATION"),
        },
        "quarantine": {
            "auto": env.flag("SENTIENTOS_QUARANTINE_AUTO"),
            "freeze_forge": env.flag("SENTIENTOS_QUARANTINE_FREEZE_FORGE"),
        },
        "signing": {
            "rollup_mode": env.str_or("SENTIENTOS_ROLLUP_SIGNING", "off"),
            "strategic_mode": env.str_or("SENTIENTOS_STRATEGIC_SIGNING", "off"),
            "snapshot_mode": env.str_or("SENTIENTOS_ATTESTATION_SNAPSHOT_SIGNING", "off"),
            "anchor_mode": env.str_or("SENTIENTOS_RECEIPT_ANCHOR_SIGNING", "off"),
            "rollup_verify": verify_block(env, "SENTIENTOS_ROLLUP_SIG"),
            "strategic_verify": verify_block(env, "SENTIENTOS_STRATEGIC_SIG"),
            "snapshot_verify": verify_block(env, "SENTIENTOS_ATTESTATION_SNAPSHOT"),
            "witness": {
                "anchor_publish": env.flag("SENTIENTOS_ANCHOR_WITNESS_PUBLISH"),
                "anchor_backend": env.str_or("SENTIENTOS_ANCHOR_WITNESS_BACKEND", "file"),
                "snapshot_publish": env.flag("SENTIENTOS_ATTESTATION_SNAPSHOT_WITNESS_PUBLISH"),
                "snapshot_backend": env.str_or("SENTIENTOS_ATTESTATION_SNAPSHOT_WITNESS_BACKEND", "file"),
            },
        },
        "budget": {
            "max_verify_streams": env.int_or("SENTIENTOS_INTEGRITY_MAX_VERIFY_STREAMS", 3),
            "max_verify_last_n": env.int_or("SENTIENTOS_INTEGRITY_MAX_VERIFY_LAST_N", 25),
            "snapshot_min_interval_seconds": env.int_or("SENTIENTOS_ATTESTATION_SNAPSHOT_MIN_INTERVAL_SECONDS", 600),
        },
        "forge": {
            "max_runs_per_day": env.int_or("SENTIENTOS_FORGE_MAX_RUNS_PER_DAY", 2),
            "max_runs_per_hour": env.int_or("SENTIENTOS_FORGE_MAX_RUNS_PER_HOUR", 1),
            "max_files_changed_per_day": env.int_or("SENTIENTOS_FORGE_MAX_FILES_CHANGED_PER_DAY", 200),
            "max_retries": env.int_or("SENTIENTOS_FORGE_MAX_RETRIES", 1),
        },
    })
}

/// Hash of the canonical policy dictionary.
pub fn compute_policy_hash(policy: &Value) -> Result<String, CoreError> {
    Ok(hash_canonical(policy)?)
}

/// Write the fingerprint artifact and its pulse row.
pub fn emit_policy_fingerprint(
    root: &Path,
    env: &Env,
    ts: Option<&str>,
) -> Result<PolicyFingerprint, CoreError> {
    let generated_at = ts.map(str::to_string).unwrap_or_else(iso_now);
    let policy = build_policy_dict(env);
    let policy_hash = compute_policy_hash(&policy)?;
    let rel = PathBuf::from(paths::POLICY_DIR).join(format!("policy_{}.json", safe_ts(&generated_at)));
    let payload = json!({
        "schema_version": 1,
        "ts": generated_at,
        "policy": policy,
        "policy_hash": policy_hash,
    });
    io::write_json_atomic(&root.join(&rel), &payload)?;
    let mut pulse_row = payload.clone();
    pulse_row["path"] = json!(rel.to_string_lossy());
    io::append_jsonl(&root.join(paths::POLICY_PULSE), &pulse_row)?;
    Ok(PolicyFingerprint {
        ts: generated_at,
        policy,
        policy_hash,
        path: rel.to_string_lossy().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_identical_environment() {
        let env = Env::from_pairs([("SENTIENTOS_POSTURE", "stability")]);
        let one = compute_policy_hash(&build_policy_dict(&env)).unwrap();
        let two = compute_policy_hash(&build_policy_dict(&env)).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn hash_tracks_configuration_changes() {
        let base = compute_policy_hash(&build_policy_dict(&Env::default())).unwrap();
        let env = Env::from_pairs([("SENTIENTOS_ROLLUP_SIGNING", "hmac-test")]);
        let changed = compute_policy_hash(&build_policy_dict(&env)).unwrap();
        assert_ne!(base, changed);
    }

    #[test]
    fn emit_writes_artifact_and_pulse_row() {
        let dir = tempfile::tempdir().unwrap();
        let fingerprint =
            emit_policy_fingerprint(dir.path(), &Env::default(), Some("2026-01-01T00:00:00Z"))
                .unwrap();
        assert!(dir.path().join(&fingerprint.path).exists());
        let pulse = io::read_jsonl(&dir.path().join(paths::POLICY_PULSE));
        assert_eq!(pulse.len(), 1);
        assert_eq!(pulse[0]["policy_hash"], json!(fingerprint.policy_hash));
    }
}
