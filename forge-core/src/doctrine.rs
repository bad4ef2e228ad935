//! Doctrine identity and federation divergence gates.

use std::path::Path;

use serde_json::{json, Map, Value};

use sos_chain::io;
use sos_config::paths;
use sos_enc::hash_canonical;
use sos_envelope::latest_sig_hash;

use crate::snapshot::snapshot_stream_paths;

/// Locally computed identity components: the vow-manifest digest plus the
/// pulse and perception schema fingerprints.
pub fn identity_components(root: &Path) -> Value {
    let mut components = Map::new();
    components.insert(
        "vow_manifest_sha256".to_string(),
        io::sha256_file(&root.join(paths::VOW_MANIFEST))
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    for (key, rel) in [
        ("pulse_schema_fingerprint", "schemas/pulse_schema.json"),
        ("perception_schema_fingerprint", "schemas/perception_schema.json"),
    ] {
        components.insert(
            key.to_string(),
            io::sha256_file(&root.join(rel)).map(Value::from).unwrap_or(Value::Null),
        );
    }
    Value::Object(components)
}

/// Compare the local identity against the published federation baseline.
/// Returns `(ok, payload)` where `payload.mismatch` drives the gate.
pub fn verify_doctrine_identity(root: &Path) -> (bool, Value) {
    let Some(baseline) = io::read_json(&root.join(paths::FEDERATION_BASELINE)) else {
        return (
            true,
            json!({"mismatch": false, "reason": "baseline_missing"}),
        );
    };
    let current = identity_components(root);
    let current_digest = hash_canonical(&current).unwrap_or_default();
    let baseline_digest = baseline
        .get("identity_digest")
        .and_then(Value::as_str)
        .unwrap_or("");
    let baseline_components = baseline
        .get("identity_components")
        .cloned()
        .unwrap_or(Value::Null);

    let mut changed_components: Vec<Value> = Vec::new();
    if let (Some(before), Some(after)) = (baseline_components.as_object(), current.as_object()) {
        let keys: std::collections::BTreeSet<&String> =
            before.keys().chain(after.keys()).collect();
        for key in keys {
            let prior = before.get(key.as_str()).cloned().unwrap_or(Value::Null);
            let now = after.get(key.as_str()).cloned().unwrap_or(Value::Null);
            if prior != now {
                changed_components.push(json!({"component": key, "before": prior, "after": now}));
            }
        }
    }

    let mismatch = baseline_digest != current_digest || !changed_components.is_empty();
    let payload = json!({
        "mismatch": mismatch,
        "baseline_fingerprint": baseline_digest,
        "current_fingerprint": current_digest,
        "changed_components": changed_components,
    });
    (!mismatch, payload)
}

/// Capture the current identity as the new baseline.
pub fn capture_identity_baseline(root: &Path) -> Result<Value, sos_chain::ChainError> {
    let components = identity_components(root);
    let digest = hash_canonical(&components).unwrap_or_default();
    let baseline = json!({
        "schema_version": 1,
        "identity_components": components,
        "identity_digest": digest,
    });
    io::write_json_atomic(&root.join(paths::FEDERATION_BASELINE), &baseline)?;
    Ok(baseline)
}

/// Compare integrity digests across federation peers.
///
/// Each peer file under `glow/federation/peers/` carries the triple
/// `(attestation_snapshot_sig_hash, integrity_status_hash, policy_hash)`.
/// Any peer disagreeing with the local triple marks the federation diverged.
pub fn federation_integrity_gate(root: &Path) -> Value {
    let peers_dir = root.join(paths::FEDERATION_PEERS_DIR);
    let Ok(read_dir) = std::fs::read_dir(&peers_dir) else {
        return json!({"status": "no_peer_snapshot", "divergence_reasons": [], "peer_summaries": []});
    };
    let mut names: Vec<String> = read_dir
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".json"))
        .collect();
    names.sort();
    if names.is_empty() {
        return json!({"status": "no_peer_snapshot", "divergence_reasons": [], "peer_summaries": []});
    }

    let local = local_integrity_triple(root);
    let mut divergence_reasons: Vec<String> = Vec::new();
    let mut peer_summaries: Vec<Value> = Vec::new();
    for name in &names {
        let Some(peer) = io::read_json(&peers_dir.join(name)) else {
            divergence_reasons.push(format!("{name}: bad_json"));
            continue;
        };
        let mut mismatched: Vec<&str> = Vec::new();
        for key in [
            "attestation_snapshot_sig_hash",
            "integrity_status_hash",
            "policy_hash",
        ] {
            if peer.get(key) != local.get(key) {
                mismatched.push(key);
            }
        }
        if !mismatched.is_empty() {
            divergence_reasons.push(format!("{name}: {}", mismatched.join(",")));
        }
        peer_summaries.push(json!({
            "peer": name,
            "diverged": !mismatched.is_empty(),
            "integrity_status_hash": peer.get("integrity_status_hash").cloned().unwrap_or(Value::Null),
        }));
    }

    json!({
        "status": if divergence_reasons.is_empty() { "ok" } else { "diverged" },
        "divergence_reasons": divergence_reasons,
        "peer_summaries": peer_summaries,
    })
}

/// The local `(snapshot sig tip, integrity status hash, policy hash)` triple.
pub fn local_integrity_triple(root: &Path) -> Value {
    let sig_tip = latest_sig_hash(&root.join(&snapshot_stream_paths().index_path));
    let (status_hash, policy_hash) = latest_integrity_status(root)
        .map(|status| {
            let hash = hash_canonical(&status).unwrap_or_default();
            let policy = status
                .get("policy_hash")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (Some(hash), Some(policy))
        })
        .unwrap_or((None, None));
    json!({
        "attestation_snapshot_sig_hash": sig_tip,
        "integrity_status_hash": status_hash,
        "policy_hash": policy_hash,
    })
}

/// Newest persisted integrity status artifact.
pub fn latest_integrity_status(root: &Path) -> Option<Value> {
    let status_dir = root.join(paths::INTEGRITY_DIR);
    let mut names: Vec<String> = std::fs::read_dir(&status_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("status_") && name.ends_with(".json"))
        .collect();
    names.sort();
    names.pop().and_then(|name| io::read_json(&status_dir.join(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_baseline_is_not_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (ok, payload) = verify_doctrine_identity(dir.path());
        assert!(ok);
        assert_eq!(payload["mismatch"], json!(false));
    }

    #[test]
    fn captured_baseline_matches_until_the_manifest_changes() {
        let dir = tempfile::tempdir().unwrap();
        io::write_json_atomic(
            &dir.path().join(paths::VOW_MANIFEST),
            &json!({"vows": ["stability"]}),
        )
        .unwrap();
        capture_identity_baseline(dir.path()).unwrap();

        let (ok, _) = verify_doctrine_identity(dir.path());
        assert!(ok);

        io::write_json_atomic(
            &dir.path().join(paths::VOW_MANIFEST),
            &json!({"vows": ["velocity"]}),
        )
        .unwrap();
        let (ok, payload) = verify_doctrine_identity(dir.path());
        assert!(!ok);
        assert_eq!(payload["mismatch"], json!(true));
        assert!(!payload["changed_components"].as_array().unwrap().is_empty());
    }

    #[test]
    fn no_peers_is_skipped_not_diverged() {
        let dir = tempfile::tempdir().unwrap();
        let gate = federation_integrity_gate(dir.path());
        assert_eq!(gate["status"], json!("no_peer_snapshot"));
    }

    #[test]
    fn disagreeing_peer_marks_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let local = local_integrity_triple(dir.path());
        io::write_json_atomic(
            &dir.path().join(paths::FEDERATION_PEERS_DIR).join("peer_a.json"),
            &local,
        )
        .unwrap();
        assert_eq!(federation_integrity_gate(dir.path())["status"], json!("ok"));

        io::write_json_atomic(
            &dir.path().join(paths::FEDERATION_PEERS_DIR).join("peer_b.json"),
            &json!({
                "attestation_snapshot_sig_hash": "deadbeef",
                "integrity_status_hash": "deadbeef",
                "policy_hash": "deadbeef",
            }),
        )
        .unwrap();
        let gate = federation_integrity_gate(dir.path());
        assert_eq!(gate["status"], json!("diverged"));
        assert_eq!(gate["divergence_reasons"].as_array().unwrap().len(), 1);
    }
}
