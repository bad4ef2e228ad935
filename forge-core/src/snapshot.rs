//! Attestation snapshots.
//!
//! A snapshot freezes the tick's fingerprints (policy hash, integrity status
//! hash, signature tips) into one artifact, optionally signed into the
//! snapshot envelope stream. The cadence gate suppresses emission when the
//! minimum interval has not elapsed or nothing changed since the last emit.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde_json::{json, Value};
use tracing::info;

use sos_chain::io;
use sos_config::{paths, Env};
use sos_envelope::{maybe_sign, verify_stream, ObjectRef, Stream, StreamPaths, VerifyResult};

use crate::witness::publish_witness;
use crate::{safe_ts, CoreError};

/// One attestation snapshot.
#[derive(Debug, Clone)]
pub struct AttestationSnapshot {
    pub ts: String,
    pub policy_hash: String,
    pub integrity_status_hash: String,
    pub latest_rollup_sig_hash: Option<String>,
    pub latest_strategic_sig_hash: Option<String>,
    pub latest_catalog_checkpoint_hash: Option<String>,
    pub goal_graph_hash: Option<String>,
    pub doctrine_bundle_sha256: Option<String>,
    pub witness_summary: Value,
}

impl AttestationSnapshot {
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": 1,
            "ts": self.ts,
            "policy_hash": self.policy_hash,
            "integrity_status_hash": self.integrity_status_hash,
            "latest_rollup_sig_hash": self.latest_rollup_sig_hash,
            "latest_strategic_sig_hash": self.latest_strategic_sig_hash,
            "latest_catalog_checkpoint_hash": self.latest_catalog_checkpoint_hash,
            "goal_graph_hash": self.goal_graph_hash,
            "doctrine_bundle_sha256": self.doctrine_bundle_sha256,
            "witness_summary": self.witness_summary,
        })
    }
}

pub fn snapshot_stream_paths() -> StreamPaths {
    StreamPaths::new(PathBuf::from(paths::SNAPSHOT_SIG_DIR))
}

/// Newest emitted snapshot payload, if any.
pub fn latest_snapshot(root: &Path) -> Option<Value> {
    let snapshot_dir = root.join(paths::SNAPSHOT_DIR);
    let mut names: Vec<String> = std::fs::read_dir(&snapshot_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("snapshot_") && name.ends_with(".json"))
        .collect();
    names.sort();
    names.pop().and_then(|name| io::read_json(&snapshot_dir.join(name)))
}

/// Cadence gate: emit only when the minimum interval elapsed AND the
/// `(integrity_status_hash, policy_hash, goal_graph_hash)` triple changed.
pub fn should_emit_snapshot(
    root: &Path,
    env: &Env,
    ts: &str,
    integrity_status_hash: &str,
    policy_hash: &str,
    goal_graph_hash: Option<&str>,
) -> bool {
    let min_interval = env
        .int_or("SENTIENTOS_ATTESTATION_SNAPSHOT_MIN_INTERVAL_SECONDS", 600)
        .max(1);
    let Some(last) = latest_snapshot(root) else {
        return true;
    };

    let same_triple = last.get("integrity_status_hash").and_then(Value::as_str)
        == Some(integrity_status_hash)
        && last.get("policy_hash").and_then(Value::as_str) == Some(policy_hash)
        && last.get("goal_graph_hash").and_then(Value::as_str) == goal_graph_hash;
    if same_triple {
        return false;
    }

    let last_ts = last.get("ts").and_then(Value::as_str).unwrap_or("");
    match (parse_ts(ts), parse_ts(last_ts)) {
        (Some(now), Some(prev)) => (now - prev).num_seconds() >= min_interval,
        _ => true,
    }
}

/// Write the snapshot artifact and its pulse row; returns the relative path.
pub fn emit_snapshot(root: &Path, snapshot: &AttestationSnapshot) -> Result<String, CoreError> {
    let rel = PathBuf::from(paths::SNAPSHOT_DIR).join(format!("snapshot_{}.json", safe_ts(&snapshot.ts)));
    let payload = snapshot.to_value();
    io::write_json_atomic(&root.join(&rel), &payload)?;
    let mut pulse_row = payload;
    pulse_row["path"] = json!(rel.to_string_lossy());
    io::append_jsonl(&root.join(paths::SNAPSHOT_PULSE), &pulse_row)?;
    info!(path = %rel.display(), "attestation snapshot emitted");
    Ok(rel.to_string_lossy().to_string())
}

/// Sign the snapshot into its envelope stream when signing is configured.
pub fn maybe_sign_snapshot(
    root: &Path,
    env: &Env,
    snapshot_rel_path: &str,
    snapshot_payload: &Value,
) -> Result<Option<Value>, CoreError> {
    let ts = snapshot_payload
        .get("ts")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    Ok(maybe_sign(
        root,
        env,
        Stream::AttestationSnapshot,
        &snapshot_stream_paths(),
        &ObjectRef {
            object_id: ts,
            created_at: ts,
            rel_path: snapshot_rel_path,
            payload: snapshot_payload,
        },
    )?)
}

/// Verify the newest snapshot envelopes under the per-stream policy.
pub fn verify_recent_snapshots(
    root: &Path,
    env: &Env,
    last: usize,
) -> Result<VerifyResult, CoreError> {
    let policy = sos_envelope::parse_verify_policy(env, "SENTIENTOS_ATTESTATION_SNAPSHOT", last);
    if !policy.enabled {
        return Ok(VerifyResult {
            ok: true,
            status: "skipped".to_string(),
            reason: Some("verify_disabled".to_string()),
            checked_n: 0,
            last_ok_hash: None,
        });
    }
    Ok(verify_stream(
        root,
        env,
        Stream::AttestationSnapshot,
        &snapshot_stream_paths(),
        policy.last_n.min(last.max(1)),
        policy.enforce,
    )?)
}

/// Publish the newest snapshot signature as a witness when enabled.
pub fn maybe_publish_snapshot_witness(
    root: &Path,
    env: &Env,
    allow_git_tag_publish: bool,
) -> Result<Value, CoreError> {
    if !env.flag("SENTIENTOS_ATTESTATION_SNAPSHOT_WITNESS_PUBLISH") {
        return Ok(json!({"status": "disabled", "published_at": null, "failure": null, "tag": null}));
    }
    let rows = io::read_jsonl(&root.join(&snapshot_stream_paths().index_path));
    let Some(latest) = rows.last() else {
        return Ok(json!({"status": "failed", "published_at": null, "failure": "signature_missing", "tag": null}));
    };
    let sig_hash = latest.get("sig_hash").and_then(Value::as_str).unwrap_or("");
    let created = latest.get("created_at").and_then(Value::as_str).unwrap_or("");
    let tag = format!(
        "sentientos-attestation-snapshot/{}/{}",
        &created[..created.len().min(10)],
        &sig_hash[..sig_hash.len().min(16)]
    );
    let backend = env.str_or("SENTIENTOS_ATTESTATION_SNAPSHOT_WITNESS_BACKEND", "file");
    let witness = publish_witness(
        root,
        backend,
        &tag,
        &format!("snapshot_sig_hash: {sig_hash}"),
        &root.join("glow/federation/attestation_snapshot_witness_tags.jsonl"),
        &json!({"tag": tag, "sig_hash": sig_hash, "published_at": created}),
        allow_git_tag_publish,
    )?;
    Ok(witness.to_value())
}

fn parse_ts(value: &str) -> Option<DateTime<chrono::Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&chrono::Utc))
}
