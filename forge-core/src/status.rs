//! `forge status` summary assembly and exit-code policy.

use serde_json::{json, Value};

use sos_enc::hash_canonical;

use crate::controller::REASON_INTEGRITY_OK;
use crate::doctrine::latest_integrity_status;
use crate::snapshot::{latest_snapshot, should_emit_snapshot, snapshot_stream_paths};
use crate::{CoreContext, CoreError};

/// Operator summary over the latest persisted artifacts.
pub fn build_status_payload(ctx: &CoreContext) -> Result<Value, CoreError> {
    let root = &ctx.root;
    let integrity = latest_integrity_status(root);
    let snapshot = latest_snapshot(root);
    let sig_tip = sos_envelope::latest_sig_hash(&root.join(&snapshot_stream_paths().index_path));

    let status_hash = integrity
        .as_ref()
        .map(|status| hash_canonical(status))
        .transpose()?;

    let empty = json!({});
    let integrity_ref = integrity.as_ref().unwrap_or(&empty);
    let snapshot_ref = snapshot.as_ref().unwrap_or(&empty);

    let reason_stack: Vec<String> = integrity_ref
        .get("reason_stack")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .take(5)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let cadence = match (&integrity, &snapshot) {
        (None, _) => json!({"emitted": snapshot.is_some(), "reason": "integrity_status_missing"}),
        (_, None) => json!({"emitted": false, "reason": "snapshot_missing"}),
        (Some(status), Some(last)) => {
            let can_emit = should_emit_snapshot(
                root,
                &ctx.env,
                status.get("ts").and_then(Value::as_str).unwrap_or(""),
                status_hash.as_deref().unwrap_or(""),
                status.get("policy_hash").and_then(Value::as_str).unwrap_or(""),
                None,
            );
            json!({
                "emitted": true,
                "reason": if can_emit { "eligible_to_emit" } else { "cadence_not_elapsed" },
                "last_emit_ts": last.get("ts").cloned().unwrap_or(Value::Null),
            })
        }
    };

    let signature_verification = map_signature_gates(integrity_ref);

    Ok(json!({
        "posture": integrity_ref.get("strategic_posture").cloned().unwrap_or(Value::Null),
        "mode": integrity_ref.get("operating_mode").cloned().unwrap_or(Value::Null),
        "quarantine": integrity_ref.get("quarantine_active").cloned().unwrap_or(Value::Null),
        "pressure": integrity_ref.get("pressure_summary").cloned().unwrap_or(Value::Null),
        "integrity_primary_reason": integrity_ref.get("primary_reason").cloned().unwrap_or(Value::Null),
        "integrity_reason_stack_top5": reason_stack,
        "allow": {
            "mutation": integrity_ref.get("mutation_allowed").and_then(Value::as_bool).unwrap_or(false),
            "publish": integrity_ref.get("publish_allowed").and_then(Value::as_bool).unwrap_or(false),
            "automerge": integrity_ref.get("automerge_allowed").and_then(Value::as_bool).unwrap_or(false),
        },
        "budget": {
            "remaining": integrity_ref.get("budget_remaining").cloned().unwrap_or(json!({})),
            "exhausted": integrity_ref.get("budget_exhausted").and_then(Value::as_bool).unwrap_or(false),
        },
        "snapshot": {
            "present": snapshot.is_some(),
            "cadence": cadence,
            "signature_tip": sig_tip,
            "policy_hash": snapshot_ref.get("policy_hash").cloned().unwrap_or(Value::Null),
            "integrity_status_hash": snapshot_ref.get("integrity_status_hash").cloned().unwrap_or(Value::Null),
        },
        "signature_verification": signature_verification,
        "policy_hash": integrity_ref
            .get("policy_hash")
            .cloned()
            .or_else(|| snapshot_ref.get("policy_hash").cloned())
            .unwrap_or(Value::Null),
        "integrity_status_hash": status_hash,
        "artifacts": {
            "integrity_status_present": integrity.is_some(),
            "attestation_snapshot_present": snapshot.is_some(),
        },
    }))
}

fn map_signature_gates(integrity: &Value) -> Value {
    let mut out = serde_json::Map::new();
    let gates = integrity
        .get("gate_results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for (key, gate_name) in [
        ("snapshot", "attestation_snapshot_signatures"),
        ("rollup", "rollup_signatures"),
        ("strategic", "strategic_signatures"),
    ] {
        let gate = gates
            .iter()
            .find(|gate| gate.get("name").and_then(Value::as_str) == Some(gate_name));
        out.insert(
            key.to_string(),
            json!({
                "status": gate
                    .and_then(|g| g.get("status").and_then(Value::as_str))
                    .unwrap_or("skipped"),
                "reason": gate
                    .and_then(|g| g.get("reason").and_then(Value::as_str))
                    .unwrap_or("not_evaluated"),
            }),
        );
    }
    Value::Object(out)
}

/// Exit-code policy: `3` no artifacts, `2` mutation disallowed with a non-OK
/// reason, `1` any signature-stream warning, `0` otherwise.
pub fn status_exit_code(payload: &Value) -> i32 {
    let has_integrity = payload["artifacts"]["integrity_status_present"]
        .as_bool()
        .unwrap_or(false);
    let has_snapshot = payload["artifacts"]["attestation_snapshot_present"]
        .as_bool()
        .unwrap_or(false);
    if !has_integrity && !has_snapshot {
        return 3;
    }
    let mutation = payload["allow"]["mutation"].as_bool().unwrap_or(false);
    let primary = payload["integrity_primary_reason"].as_str();
    if !mutation && primary.map(|p| p != REASON_INTEGRITY_OK).unwrap_or(false) {
        return 2;
    }
    let any_warn = payload["signature_verification"]
        .as_object()
        .map(|streams| {
            streams
                .values()
                .any(|item| item.get("status").and_then(Value::as_str) == Some("warn"))
        })
        .unwrap_or(false);
    if any_warn {
        return 1;
    }
    0
}
