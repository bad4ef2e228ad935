//! Deterministic replay.
//!
//! Re-evaluates the integrity surface without performing any mutating
//! publish: no snapshot unless explicitly requested, no catalog rebuild
//! unless explicitly allowed, and never a git-tag witness attempt.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::info;

use sos_chain::io;
use sos_config::paths;

use crate::controller::{evaluate_integrity, GateResult, IntegrityBudget};
use crate::policy_fingerprint::{build_policy_dict, compute_policy_hash, emit_policy_fingerprint};
use crate::rollups::{latest_catalog_checkpoint_hash, verify_signed_rollups};
use crate::snapshot::{
    emit_snapshot, should_emit_snapshot, verify_recent_snapshots, AttestationSnapshot,
};
use crate::strategic::verify_recent_strategic;
use crate::{iso_now, safe_ts, CoreContext, CoreError};

/// Replay parameters.
#[derive(Debug, Clone)]
pub struct ReplayArgs {
    pub verify: bool,
    pub last_n: usize,
    pub emit_snapshot: bool,
    pub write_policy: bool,
}

impl Default for ReplayArgs {
    fn default() -> Self {
        Self {
            verify: true,
            last_n: 25,
            emit_snapshot: false,
            write_policy: false,
        }
    }
}

/// Run a replay and write its report.
pub fn replay(ctx: &CoreContext, args: &ReplayArgs) -> Result<Value, CoreError> {
    let root = &ctx.root;
    let last_n = args.last_n.max(1);
    // Pin the stream item budget to the requested window for this call only.
    let replay_env = ctx
        .env
        .clone()
        .with("SENTIENTOS_INTEGRITY_MAX_VERIFY_LAST_N", &last_n.to_string());
    let replay_ctx = CoreContext::with_env(root, replay_env);
    let env = &replay_ctx.env;

    let catalog_status = if root.join(paths::CATALOG).exists() {
        json!({"status": "present", "reason": "catalog_exists"})
    } else if env.flag("SENTIENTOS_ALLOW_CATALOG_REBUILD") {
        io::write_jsonl_atomic(&root.join(paths::CATALOG), &[])?;
        json!({"status": "rebuilt", "reason": "catalog_rebuilt"})
    } else {
        json!({"status": "skipped", "reason": "skipped_catalog_rebuild"})
    };

    // The fingerprint reflects the caller's configuration, not the replay's
    // pinned verification window.
    let mut policy_hash = compute_policy_hash(&build_policy_dict(&ctx.env))?;
    let mut policy_write_path: Option<String> = None;
    if args.write_policy {
        let fingerprint = emit_policy_fingerprint(root, &ctx.env, None)?;
        policy_hash = fingerprint.policy_hash;
        policy_write_path = Some(fingerprint.path);
    }

    let integrity = evaluate_integrity(&replay_ctx, &policy_hash, None)?;
    let integrity_hash = integrity.canonical_hash()?;

    let verification = if args.verify {
        budgeted_verify(&replay_ctx, last_n)?
    } else {
        json!({})
    };

    let snapshot_emission =
        maybe_emit_replay_snapshot(&replay_ctx, args, &integrity, &integrity_hash, &policy_hash)?;

    let ts = iso_now();
    let payload = json!({
        "schema_version": 1,
        "ts": ts,
        "inputs": {
            "policy_hash": policy_hash,
            "last_n": last_n,
            "verify": args.verify,
            "emit_snapshot": args.emit_snapshot,
            "write_policy": args.write_policy,
            "replay_mode": true,
        },
        "catalog": catalog_status,
        "integrity": {
            "status": integrity.status(),
            "primary_reason": integrity.primary_reason,
            "policy_hash": integrity.policy_hash,
            "integrity_status_hash": integrity_hash,
            "gates": integrity.gate_results.iter().map(GateResult::to_value).collect::<Vec<_>>(),
            "mutation_allowed": integrity.mutation_allowed,
            "publish_allowed": integrity.publish_allowed,
            "automerge_allowed": integrity.automerge_allowed,
        },
        "verification": verification,
        "snapshot_emission": snapshot_emission,
        "writes": {"policy_path": policy_write_path},
    });

    let out_rel = PathBuf::from(paths::REPLAY_DIR).join(format!("replay_{}.json", safe_ts(&ts)));
    io::write_json_atomic(&root.join(&out_rel), &payload)?;
    io::append_jsonl(
        &root.join(paths::REPLAY_PULSE),
        &json!({"ts": ts, "path": out_rel.to_string_lossy(), "integrity_status": integrity.status()}),
    )?;
    info!(path = %out_rel.display(), "replay report written");
    Ok(payload)
}

/// Stream verification under the same budget as a live tick.
fn budgeted_verify(ctx: &CoreContext, last_n: usize) -> Result<Value, CoreError> {
    let root = &ctx.root;
    let env = &ctx.env;
    let budget = IntegrityBudget::from_env(env);
    let verify_last_n = last_n.min(budget.max_verify_items_per_stream);

    const STREAM_ORDER: [(&str, &str); 3] = [
        ("attestation_snapshot_signatures", "SENTIENTOS_ATTESTATION_SNAPSHOT_VERIFY"),
        ("rollup_signatures", "SENTIENTOS_ROLLUP_SIG_VERIFY"),
        ("strategic_signatures", "SENTIENTOS_STRATEGIC_SIG_VERIFY"),
    ];
    let active: Vec<&str> = STREAM_ORDER
        .iter()
        .filter(|(_, flag)| env.flag(flag))
        .map(|(name, _)| *name)
        .collect();
    let allowed: std::collections::BTreeSet<&str> = active
        .iter()
        .take(budget.max_verify_streams_per_tick)
        .copied()
        .collect();

    let mut results = serde_json::Map::new();
    for (name, _) in STREAM_ORDER {
        if !active.contains(&name) {
            results.insert(
                name.to_string(),
                json!({"status": "skipped", "reason": "verify_disabled", "checked_n": 0}),
            );
            continue;
        }
        if !allowed.contains(name) {
            results.insert(
                name.to_string(),
                json!({"status": "skipped", "reason": "skipped_budget_exhausted", "checked_n": 0}),
            );
            continue;
        }
        let result = match name {
            "attestation_snapshot_signatures" => verify_recent_snapshots(root, env, verify_last_n)?,
            "rollup_signatures" => verify_signed_rollups(root, env, verify_last_n)?,
            _ => verify_recent_strategic(root, env, verify_last_n)?,
        };
        results.insert(
            name.to_string(),
            json!({
                "status": result.status,
                "reason": result.reason.unwrap_or_else(|| "ok".to_string()),
                "checked_n": result.checked_n,
            }),
        );
    }
    Ok(Value::Object(results))
}

fn maybe_emit_replay_snapshot(
    ctx: &CoreContext,
    args: &ReplayArgs,
    integrity: &crate::controller::IntegrityStatus,
    integrity_hash: &str,
    policy_hash: &str,
) -> Result<Value, CoreError> {
    if !args.emit_snapshot {
        return Ok(json!({"emitted": false, "reason": "flag_disabled", "path": null}));
    }
    let root = &ctx.root;
    if !should_emit_snapshot(root, &ctx.env, &integrity.ts, integrity_hash, policy_hash, None) {
        return Ok(json!({"emitted": false, "reason": "cadence_not_elapsed", "path": null}));
    }
    let snapshot = AttestationSnapshot {
        ts: integrity.ts.clone(),
        policy_hash: policy_hash.to_string(),
        integrity_status_hash: integrity_hash.to_string(),
        latest_rollup_sig_hash: None,
        latest_strategic_sig_hash: None,
        latest_catalog_checkpoint_hash: latest_catalog_checkpoint_hash(root),
        goal_graph_hash: None,
        doctrine_bundle_sha256: None,
        witness_summary: json!({"replay_mode": true}),
    };
    let rel = emit_snapshot(root, &snapshot)?;
    Ok(json!({"emitted": true, "reason": "emitted", "path": rel}))
}
