//! Operator-visible observatory index.
//!
//! Fully derived from primary artifacts: losing this file costs nothing, a
//! rebuild restores it.

use serde_json::{json, Value};
use tracing::debug;

use sos_chain::{chains, io};
use sos_config::paths;
use sos_policy::{
    compute_integrity_pressure, derive_throughput_policy, load_quarantine, resolve_posture,
};

use crate::anchors::verify_receipt_anchors;
use crate::doctrine::{federation_integrity_gate, latest_integrity_status};
use crate::snapshot::{latest_snapshot, snapshot_stream_paths};
use crate::strategic::strategic_stream_paths;
use crate::rollups::latest_rollup_sig_hash;
use crate::{CoreContext, CoreError};

const LATEST_LIMIT: usize = 10;

/// Rebuild `glow/forge/forge_observatory.json` from disk.
pub fn rebuild_index(ctx: &CoreContext) -> Result<Value, CoreError> {
    let root = &ctx.root;
    let env = &ctx.env;

    let receipts_chain = chains::receipts(root);
    let receipts = receipts_chain.entries_ordered();
    let receipt_chain_status = receipts_chain.verify(Some(50)).to_value();
    let anchor_status = verify_receipt_anchors(root, env, Some(10), false)
        .map(|verification| verification.to_value())
        .unwrap_or_else(|err| json!({"status": "unknown", "error": err.to_string()}));
    let audit_status = sos_audit::verify_audit_chain(root, None).to_value();

    let (queue_rows, queue_corrupt) = io::read_jsonl_counting(&root.join(paths::QUEUE));
    let (receipt_rows, receipt_corrupt) = io::read_jsonl_counting(&root.join(paths::RECEIPTS_PULSE));
    let receipted_ids: std::collections::BTreeSet<String> = receipt_rows
        .iter()
        .filter_map(|row| row.get("request_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    let pending_queue: Vec<Value> = queue_rows
        .iter()
        .filter(|row| {
            row.get("request_id")
                .and_then(Value::as_str)
                .map(|id| !receipted_ids.contains(id))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let quarantine = load_quarantine(root);
    let pressure = compute_integrity_pressure(root, env, chrono::Utc::now());
    let throughput = derive_throughput_policy(env, pressure.level, Some(&quarantine));
    let posture = resolve_posture(env);

    let provenance = sos_provenance::load_snapshots(&root.join(paths::PROVENANCE_DIR));
    let progress_trend = progress_trend(&provenance);
    let stagnation_alert = progress_trend.len() >= 3
        && progress_trend[progress_trend.len() - 3..]
            .iter()
            .all(|run| run["improved"] == json!(false));

    let witness_status = io::read_json(&root.join(paths::WITNESS_STATUS))
        .unwrap_or_else(|| json!({"status": "disabled"}));
    let federation = federation_integrity_gate(root);

    let index = json!({
        "schema_version": 1,
        "latest_receipts": tail(&receipts),
        "latest_anchors": latest_anchor_rows(root),
        "latest_provenance": tail(
            &provenance
                .iter()
                .map(|record| {
                    json!({
                        "source": record.file_name,
                        "timestamp": record.payload.get("timestamp").cloned().unwrap_or(Value::Null),
                        "provenance_hash": record.payload.get("provenance_hash").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect::<Vec<_>>(),
        ),
        "latest_integrity_status": latest_integrity_status(root).map(|status| json!({
            "ts": status["ts"],
            "primary_reason": status["primary_reason"],
            "operating_mode": status["operating_mode"],
        })).unwrap_or(Value::Null),
        "latest_attestation_snapshot": latest_snapshot(root).map(|snapshot| json!({
            "ts": snapshot["ts"],
            "integrity_status_hash": snapshot["integrity_status_hash"],
            "policy_hash": snapshot["policy_hash"],
        })).unwrap_or(Value::Null),
        "pending_queue": pending_queue,
        "corrupt_count": {
            "queue": queue_corrupt,
            "receipts": receipt_corrupt,
            "total": queue_corrupt + receipt_corrupt,
        },
        "receipt_chain_status": receipt_chain_status,
        "anchor_status": anchor_status,
        "audit_chain_status": audit_status,
        "quarantine_active": quarantine.active,
        "quarantine_activated_at": quarantine.activated_at,
        "quarantine_last_incident_id": quarantine.last_incident_id,
        "integrity_pressure_level": pressure.level,
        "integrity_pressure_metrics": pressure.metrics.to_value(),
        "strategic_posture": posture.posture.as_str(),
        "operating_mode": throughput.mode.as_str(),
        "mode_effective_toggles": {
            "allow_automerge": throughput.allow_automerge,
            "allow_publish": throughput.allow_publish,
            "allow_forge_mutation": throughput.allow_forge_mutation,
        },
        "witness_status": witness_status,
        "federation_integrity_status": federation["status"],
        "federation_divergence_reasons": federation["divergence_reasons"],
        "signature_stream_tips": {
            "attestation_snapshots": sos_envelope::latest_sig_hash(
                &root.join(&snapshot_stream_paths().index_path)
            ),
            "strategic": sos_envelope::latest_sig_hash(
                &root.join(&strategic_stream_paths().index_path)
            ),
            "rollups": latest_rollup_sig_hash(root),
        },
        "progress_trend": progress_trend,
        "stagnation_alert": stagnation_alert,
    });

    io::write_json_atomic(&root.join(paths::OBSERVATORY_INDEX), &index)?;
    debug!("observatory index rebuilt");
    Ok(index)
}

fn tail(rows: &[Value]) -> Vec<Value> {
    let skip = rows.len().saturating_sub(LATEST_LIMIT);
    rows.iter().skip(skip).cloned().collect()
}

fn latest_anchor_rows(root: &std::path::Path) -> Vec<Value> {
    let rows = io::read_jsonl(&root.join(paths::ANCHORS_INDEX));
    tail(&rows)
}

/// The last ten repo-improvement runs with their `improved` flags.
fn progress_trend(provenance: &[sos_provenance::SnapshotRecord]) -> Vec<Value> {
    let skip = provenance.len().saturating_sub(LATEST_LIMIT);
    let window = &provenance[skip..];
    let mut trend = Vec::new();
    let mut prior: Option<(f64, f64)> = None;
    for record in window {
        let executed = record
            .payload
            .get("executed")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let passed = record
            .payload
            .get("passed")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let improved = match prior {
            Some((prior_executed, prior_passed)) => {
                passed > prior_passed || (executed > prior_executed && passed >= prior_passed)
            }
            None => false,
        };
        trend.push(json!({
            "source": record.file_name,
            "timestamp": record.payload.get("timestamp").cloned().unwrap_or(Value::Null),
            "improved": improved,
        }));
        prior = Some((executed, passed));
    }
    trend
}
