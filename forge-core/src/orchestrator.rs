//! Orchestrator tick: one pass of evaluation, persistence, and attestation.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::info;

use sos_chain::io;
use sos_config::paths;

use crate::controller::evaluate_integrity;
use crate::doctrine::latest_integrity_status;
use crate::observatory::rebuild_index;
use crate::policy_fingerprint::emit_policy_fingerprint;
use crate::rollups::{latest_catalog_checkpoint_hash, latest_rollup_sig_hash};
use crate::snapshot::{
    emit_snapshot, maybe_publish_snapshot_witness, maybe_sign_snapshot, should_emit_snapshot,
    AttestationSnapshot,
};
use crate::strategic::strategic_stream_paths;
use crate::{safe_ts, CoreContext, CoreError};

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub policy_hash: String,
    pub integrity_status_hash: String,
    pub integrity_status: Value,
    pub status_path: String,
    pub snapshot_emission: Value,
    pub index_rebuilt: bool,
}

impl TickReport {
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": 1,
            "policy_hash": self.policy_hash,
            "integrity_status_hash": self.integrity_status_hash,
            "integrity_status": self.integrity_status["ts"],
            "status_path": self.status_path,
            "snapshot_emission": self.snapshot_emission,
            "index_rebuilt": self.index_rebuilt,
            "integrity": {
                "status": self.integrity_status["primary_reason"],
                "mutation_allowed": self.integrity_status["mutation_allowed"],
                "publish_allowed": self.integrity_status["publish_allowed"],
                "automerge_allowed": self.integrity_status["automerge_allowed"],
            },
        })
    }
}

/// Run one orchestrator tick.
///
/// Primary-artifact writes (integrity status, snapshot) are fatal on failure;
/// derived writes (pulse rows, the observatory index) are logged and left to
/// the next rebuild.
pub fn tick(ctx: &CoreContext) -> Result<TickReport, CoreError> {
    let root = &ctx.root;
    let env = &ctx.env;

    let fingerprint = emit_policy_fingerprint(root, env, None)?;
    let status = evaluate_integrity(ctx, &fingerprint.policy_hash, None)?;
    let status_value = status.to_value();
    let status_hash = status.canonical_hash()?;

    let status_rel =
        PathBuf::from(paths::INTEGRITY_DIR).join(format!("status_{}.json", safe_ts(&status.ts)));
    io::write_json_atomic(&root.join(&status_rel), &status_value)?;

    let snapshot_emission = attempt_snapshot(ctx, &status, &status_hash, &fingerprint.policy_hash)?;

    let index_rebuilt = match rebuild_index(ctx) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(error = %err, "observatory index rebuild failed, retried next tick");
            false
        }
    };

    info!(
        integrity_status_hash = %status_hash,
        emitted = snapshot_emission["emitted"].as_bool().unwrap_or(false),
        "tick complete"
    );
    Ok(TickReport {
        policy_hash: fingerprint.policy_hash,
        integrity_status_hash: status_hash,
        integrity_status: status_value,
        status_path: status_rel.to_string_lossy().to_string(),
        snapshot_emission,
        index_rebuilt,
    })
}

fn attempt_snapshot(
    ctx: &CoreContext,
    status: &crate::controller::IntegrityStatus,
    status_hash: &str,
    policy_hash: &str,
) -> Result<Value, CoreError> {
    let root = &ctx.root;
    let env = &ctx.env;
    if !should_emit_snapshot(root, env, &status.ts, status_hash, policy_hash, None) {
        return Ok(json!({"emitted": false, "reason": "cadence_not_elapsed", "path": null}));
    }

    let witness_summary = maybe_publish_snapshot_witness(root, env, status.mutation_allowed)?;
    let snapshot = AttestationSnapshot {
        ts: status.ts.clone(),
        policy_hash: policy_hash.to_string(),
        integrity_status_hash: status_hash.to_string(),
        latest_rollup_sig_hash: latest_rollup_sig_hash(root),
        latest_strategic_sig_hash: sos_envelope::latest_sig_hash(
            &root.join(&strategic_stream_paths().index_path),
        ),
        latest_catalog_checkpoint_hash: latest_catalog_checkpoint_hash(root),
        goal_graph_hash: None,
        doctrine_bundle_sha256: io::sha256_file(&root.join(paths::VOW_MANIFEST)),
        witness_summary,
    };
    let rel = emit_snapshot(root, &snapshot)?;
    let envelope = maybe_sign_snapshot(root, env, &rel, &snapshot.to_value())?;
    Ok(json!({
        "emitted": true,
        "reason": "emitted",
        "path": rel,
        "signed": envelope.is_some(),
    }))
}

/// Latest persisted integrity status hash, for status reporting.
pub fn latest_status_hash(ctx: &CoreContext) -> Option<String> {
    latest_integrity_status(&ctx.root)
        .and_then(|status| sos_enc::hash_canonical(&status).ok())
}
