//! Integrity controller: per-tick gate evaluation under a verification budget.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use sos_chain::io;
use sos_config::{paths, Env};
use sos_enc::hash_canonical;
use sos_policy::{
    compute_integrity_pressure, compute_risk_budget, derive_throughput_policy, load_quarantine,
    resolve_posture, PressureSnapshot, QuarantineState, RiskBudget, ThroughputPolicy,
};

use crate::audit_gate;
use crate::doctrine::{federation_integrity_gate, verify_doctrine_identity};
use crate::receipts::maybe_verify_receipt_chain;
use crate::anchors::maybe_verify_receipt_anchors;
use crate::rollups::{latest_catalog_checkpoint_hash, verify_signed_rollups};
use crate::snapshot::verify_recent_snapshots;
use crate::strategic::verify_recent_strategic;
use crate::{iso_now, CoreContext, CoreError};

pub const REASON_INTEGRITY_OK: &str = "integrity_ok";
pub const REASON_SKIPPED_BUDGET_EXHAUSTED: &str = "skipped_budget_exhausted";

/// Gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Ok,
    Warn,
    Fail,
    Skipped,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Ok => "ok",
            GateStatus::Warn => "warn",
            GateStatus::Fail => "fail",
            GateStatus::Skipped => "skipped",
        }
    }
}

/// One gate's outcome.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub name: &'static str,
    pub status: GateStatus,
    pub reason: String,
    pub evidence_paths: Vec<String>,
    pub checked_at: String,
}

impl GateResult {
    fn new(name: &'static str, status: GateStatus, reason: &str, checked_at: &str) -> Self {
        Self {
            name,
            status,
            reason: reason.to_string(),
            evidence_paths: Vec::new(),
            checked_at: checked_at.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "status": self.status.as_str(),
            "reason": self.reason,
            "evidence_paths": self.evidence_paths,
            "checked_at": self.checked_at,
        })
    }
}

/// Verification budget for one tick.
#[derive(Debug, Clone)]
pub struct IntegrityBudget {
    pub max_verify_streams_per_tick: usize,
    pub max_verify_items_per_stream: usize,
    pub max_snapshot_emits_per_window: usize,
    pub max_witness_attempts_per_window: usize,
}

impl IntegrityBudget {
    pub fn from_env(env: &Env) -> Self {
        Self {
            max_verify_streams_per_tick: env
                .int_or("SENTIENTOS_INTEGRITY_MAX_VERIFY_STREAMS", 3)
                .max(1) as usize,
            max_verify_items_per_stream: env
                .int_or("SENTIENTOS_INTEGRITY_MAX_VERIFY_LAST_N", 25)
                .max(1) as usize,
            max_snapshot_emits_per_window: env
                .int_or("SENTIENTOS_INTEGRITY_MAX_SNAPSHOT_PER_HOUR", 6)
                .max(1) as usize,
            max_witness_attempts_per_window: env
                .int_or("SENTIENTOS_INTEGRITY_MAX_WITNESS_PER_HOUR", 6)
                .max(1) as usize,
        }
    }
}

/// The tick's integrity verdict. `canonical_hash()` over `to_value()` is the
/// system's primary fingerprint.
#[derive(Debug, Clone)]
pub struct IntegrityStatus {
    pub ts: String,
    pub strategic_posture: String,
    pub operating_mode: String,
    pub pressure_summary: Value,
    pub quarantine_active: bool,
    pub risk_budget_summary: Value,
    pub mutation_allowed: bool,
    pub publish_allowed: bool,
    pub automerge_allowed: bool,
    pub gate_results: Vec<GateResult>,
    pub primary_reason: String,
    pub reason_stack: Vec<String>,
    pub recommended_actions: Vec<Value>,
    pub policy_hash: String,
    pub budget_exhausted: bool,
    pub budget_remaining: Value,
}

impl IntegrityStatus {
    /// `fail` if any gate failed, else `warn` if any warned, else `ok`.
    pub fn status(&self) -> &'static str {
        if self.gate_results.iter().any(|g| g.status == GateStatus::Fail) {
            "fail"
        } else if self.gate_results.iter().any(|g| g.status == GateStatus::Warn) {
            "warn"
        } else {
            "ok"
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": 1,
            "ts": self.ts,
            "strategic_posture": self.strategic_posture,
            "operating_mode": self.operating_mode,
            "pressure_summary": self.pressure_summary,
            "quarantine_active": self.quarantine_active,
            "risk_budget_summary": self.risk_budget_summary,
            "mutation_allowed": self.mutation_allowed,
            "publish_allowed": self.publish_allowed,
            "automerge_allowed": self.automerge_allowed,
            "gate_results": self.gate_results.iter().map(GateResult::to_value).collect::<Vec<_>>(),
            "primary_reason": self.primary_reason,
            "reason_stack": self.reason_stack,
            "recommended_actions": self.recommended_actions,
            "policy_hash": self.policy_hash,
            "budget_exhausted": self.budget_exhausted,
            "budget_remaining": self.budget_remaining,
        })
    }

    pub fn canonical_hash(&self) -> Result<String, CoreError> {
        Ok(hash_canonical(&self.to_value())?)
    }
}

/// Decision inputs resolved once per tick.
pub struct TickInputs {
    pub quarantine: QuarantineState,
    pub pressure: PressureSnapshot,
    pub throughput: ThroughputPolicy,
    pub risk_budget: RiskBudget,
}

pub fn resolve_tick_inputs(ctx: &CoreContext) -> TickInputs {
    let quarantine = load_quarantine(&ctx.root);
    let pressure = compute_integrity_pressure(&ctx.root, &ctx.env, Utc::now());
    let posture = resolve_posture(&ctx.env);
    let throughput = derive_throughput_policy(&ctx.env, pressure.level, Some(&quarantine));
    let risk_budget = compute_risk_budget(
        &ctx.env,
        &posture,
        pressure.level,
        throughput.mode,
        quarantine.active,
    );
    TickInputs {
        quarantine,
        pressure,
        throughput,
        risk_budget,
    }
}

/// Evaluate every gate and assemble the tick's `IntegrityStatus`.
///
/// Given the same on-disk state and environment snapshot (and a pinned
/// timestamp via `checked_at`), two sequential evaluations return identical
/// `to_value()` trees.
pub fn evaluate_integrity(
    ctx: &CoreContext,
    policy_hash: &str,
    checked_at: Option<&str>,
) -> Result<IntegrityStatus, CoreError> {
    let root = &ctx.root;
    let env = &ctx.env;
    let checked_at = checked_at.map(str::to_string).unwrap_or_else(iso_now);
    let inputs = resolve_tick_inputs(ctx);
    let posture = resolve_posture(env);
    let budget = IntegrityBudget::from_env(env);

    let mut gates: Vec<GateResult> = Vec::new();
    gates.push(gate_doctrine(root, env, &checked_at));
    gates.push(gate_receipt_chain(root, env, &checked_at));
    gates.push(gate_receipt_anchors(root, env, &checked_at)?);
    gates.push(gate_audit_chain(root, env, &checked_at)?);
    let verification_gates = budgeted_signature_gates(root, env, &budget, &checked_at)?;
    gates.extend(verification_gates.iter().cloned());
    gates.push(gate_catalog_checkpoint(root, env, &checked_at));
    gates.push(gate_mypy_ratchet(root, &checked_at));
    gates.push(gate_federation_snapshot(root, env, &checked_at));

    let reason_stack: Vec<String> = gates
        .iter()
        .filter(|gate| matches!(gate.status, GateStatus::Warn | GateStatus::Fail))
        .map(|gate| gate.reason.clone())
        .collect();
    let primary_reason = reason_stack
        .first()
        .cloned()
        .unwrap_or_else(|| REASON_INTEGRITY_OK.to_string());

    let mut mutation_allowed = !inputs.quarantine.active
        && inputs.throughput.allow_forge_mutation
        && inputs.risk_budget.forge_max_files_changed > 0;
    if gates.iter().any(|gate| gate.status == GateStatus::Fail) {
        mutation_allowed = false;
    }
    let publish_allowed =
        mutation_allowed && inputs.throughput.allow_publish && !inputs.quarantine.active;
    let automerge_allowed = publish_allowed && inputs.throughput.allow_automerge;

    let budget_exhausted = verification_gates
        .iter()
        .any(|gate| gate.reason == REASON_SKIPPED_BUDGET_EXHAUSTED);
    let used_verify_streams = verification_gates
        .iter()
        .filter(|gate| gate.reason != REASON_SKIPPED_BUDGET_EXHAUSTED)
        .count();
    let budget_remaining = json!({
        "verify_streams": budget.max_verify_streams_per_tick.saturating_sub(used_verify_streams),
        "verify_items_per_stream": budget.max_verify_items_per_stream,
        "snapshot_emits_per_window": budget.max_snapshot_emits_per_window,
        "witness_attempts_per_window": budget.max_witness_attempts_per_window,
    });

    let recommended_actions = recommended_actions(&gates);
    debug!(status = ?reason_stack.first(), gates = gates.len(), "integrity evaluated");

    Ok(IntegrityStatus {
        ts: checked_at,
        strategic_posture: posture.posture.as_str().to_string(),
        operating_mode: inputs.throughput.mode.as_str().to_string(),
        pressure_summary: inputs.pressure.summary(),
        quarantine_active: inputs.quarantine.active,
        risk_budget_summary: inputs.risk_budget.summary(),
        mutation_allowed,
        publish_allowed,
        automerge_allowed,
        gate_results: gates,
        primary_reason,
        reason_stack,
        recommended_actions,
        policy_hash: policy_hash.to_string(),
        budget_exhausted,
        budget_remaining,
    })
}

fn gate_doctrine(root: &Path, env: &Env, checked_at: &str) -> GateResult {
    let (_, payload) = verify_doctrine_identity(root);
    let mismatch = payload
        .get("mismatch")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let enforce = env.flag("SENTIENTOS_DOCTRINE_IDENTITY_ENFORCE");
    let (status, reason) = match (mismatch, enforce) {
        (true, true) => (GateStatus::Fail, "doctrine_identity_mismatch"),
        (true, false) => (GateStatus::Warn, "doctrine_identity_mismatch"),
        (false, _) => (GateStatus::Ok, "ok"),
    };
    GateResult::new("doctrine_identity", status, reason, checked_at)
}

fn gate_receipt_chain(root: &Path, env: &Env, checked_at: &str) -> GateResult {
    let last = env.int_or("SENTIENTOS_RECEIPT_VERIFY_LAST_N", 25).max(1) as usize;
    let (check, fail, _warn) = maybe_verify_receipt_chain(root, env, last);
    let Some(check) = check else {
        return GateResult::new(
            "receipt_chain",
            GateStatus::Skipped,
            "receipt_chain_disabled",
            checked_at,
        );
    };
    if check.ok() || check.status == sos_chain::VerificationStatus::Unknown {
        return GateResult::new("receipt_chain", GateStatus::Ok, "ok", checked_at);
    }
    let reason = check
        .break_info
        .as_ref()
        .map(|b| b.reason.as_tag())
        .unwrap_or("receipt_chain_failed");
    GateResult::new(
        "receipt_chain",
        if fail { GateStatus::Fail } else { GateStatus::Warn },
        reason,
        checked_at,
    )
}

fn gate_receipt_anchors(root: &Path, env: &Env, checked_at: &str) -> Result<GateResult, CoreError> {
    let last = env.int_or("SENTIENTOS_ANCHOR_VERIFY_LAST_N", 10).max(1) as usize;
    let (check, fail, _warn) = maybe_verify_receipt_anchors(root, env, last)?;
    let Some(check) = check else {
        return Ok(GateResult::new(
            "receipt_anchors",
            GateStatus::Skipped,
            "receipt_anchors_disabled",
            checked_at,
        ));
    };
    if check.ok() || check.status == "missing" {
        return Ok(GateResult::new("receipt_anchors", GateStatus::Ok, "ok", checked_at));
    }
    let reason = check
        .failure_reason
        .clone()
        .unwrap_or_else(|| "anchor_verify_failed".to_string());
    Ok(GateResult::new(
        "receipt_anchors",
        if fail { GateStatus::Fail } else { GateStatus::Warn },
        &reason,
        checked_at,
    ))
}

fn gate_audit_chain(root: &Path, env: &Env, checked_at: &str) -> Result<GateResult, CoreError> {
    let (check, fail, _warn, report) = audit_gate::maybe_verify_audit_chain(root, env)?;
    let Some(check) = check else {
        return Ok(GateResult::new(
            "audit_chain",
            GateStatus::Skipped,
            "audit_chain_disabled",
            checked_at,
        ));
    };
    let mut gate = if check.ok() || check.status == "unknown" {
        GateResult::new("audit_chain", GateStatus::Ok, "ok", checked_at)
    } else {
        let reason = check
            .first_break
            .as_ref()
            .map(|fb| fb.reason)
            .unwrap_or("audit_chain_failed");
        GateResult::new(
            "audit_chain",
            if fail { GateStatus::Fail } else { GateStatus::Warn },
            reason,
            checked_at,
        )
    };
    if let Some(report) = report {
        gate.evidence_paths.push(report);
    }
    Ok(gate)
}

/// The three signature gates, capped to the stream budget with fixed
/// priority snapshot > rollup > strategic.
fn budgeted_signature_gates(
    root: &Path,
    env: &Env,
    budget: &IntegrityBudget,
    checked_at: &str,
) -> Result<Vec<GateResult>, CoreError> {
    const PLANS: [(&str, &str); 3] = [
        ("attestation_snapshot_signatures", "SENTIENTOS_ATTESTATION_SNAPSHOT_VERIFY"),
        ("rollup_signatures", "SENTIENTOS_ROLLUP_SIG_VERIFY"),
        ("strategic_signatures", "SENTIENTOS_STRATEGIC_SIG_VERIFY"),
    ];

    let active: Vec<&str> = PLANS
        .iter()
        .filter(|(_, flag)| env.flag(flag))
        .map(|(name, _)| *name)
        .collect();
    // PLANS is already in priority order; take the first `max` active.
    let allowed: std::collections::BTreeSet<&str> = active
        .iter()
        .take(budget.max_verify_streams_per_tick)
        .copied()
        .collect();

    let mut results = Vec::new();
    for (name, _) in PLANS.iter().filter(|(name, _)| active.contains(name)) {
        if !allowed.contains(name) {
            results.push(GateResult::new(
                *name,
                GateStatus::Skipped,
                REASON_SKIPPED_BUDGET_EXHAUSTED,
                checked_at,
            ));
            continue;
        }
        let items = budget.max_verify_items_per_stream;
        let result = match *name {
            "attestation_snapshot_signatures" => verify_recent_snapshots(root, env, items)?,
            "rollup_signatures" => {
                let last = env
                    .int_or("SENTIENTOS_ROLLUP_SIG_VERIFY_LAST_N", 6)
                    .max(1)
                    .min(items as i64) as usize;
                verify_signed_rollups(root, env, last)?
            }
            _ => {
                let last = env
                    .int_or("SENTIENTOS_STRATEGIC_SIG_VERIFY_LAST_N", 25)
                    .max(1)
                    .min(items as i64) as usize;
                verify_recent_strategic(root, env, last)?
            }
        };
        results.push(signature_gate_result(*name, &result, checked_at));
    }
    Ok(results)
}

fn signature_gate_result(
    name: &'static str,
    result: &sos_envelope::VerifyResult,
    checked_at: &str,
) -> GateResult {
    let status = match result.status.as_str() {
        "ok" => GateStatus::Ok,
        "fail" => GateStatus::Fail,
        "warn" => GateStatus::Warn,
        _ => GateStatus::Skipped,
    };
    let reason = match status {
        GateStatus::Ok => "ok".to_string(),
        _ => result
            .reason
            .clone()
            .unwrap_or_else(|| format!("{name}_verify_failed")),
    };
    GateResult::new(name, status, &reason, checked_at)
}

fn gate_catalog_checkpoint(root: &Path, env: &Env, checked_at: &str) -> GateResult {
    if latest_catalog_checkpoint_hash(root).is_some() {
        return GateResult::new("catalog_checkpoint", GateStatus::Ok, "ok", checked_at);
    }
    if env.flag("SENTIENTOS_SIGN_CATALOG_CHECKPOINT") {
        return GateResult::new(
            "catalog_checkpoint",
            GateStatus::Warn,
            "catalog_checkpoint_missing",
            checked_at,
        );
    }
    GateResult::new(
        "catalog_checkpoint",
        GateStatus::Skipped,
        "catalog_checkpoint_disabled",
        checked_at,
    )
}

fn gate_mypy_ratchet(root: &Path, checked_at: &str) -> GateResult {
    let Some(payload) = io::read_json(&root.join(paths::MYPY_RATCHET_STATUS)) else {
        return GateResult::new(
            "mypy_ratchet",
            GateStatus::Skipped,
            "mypy_ratchet_missing",
            checked_at,
        );
    };
    let mut gate = if payload.get("status").and_then(Value::as_str) == Some("ok") {
        GateResult::new("mypy_ratchet", GateStatus::Ok, "ok", checked_at)
    } else {
        GateResult::new("mypy_ratchet", GateStatus::Warn, "mypy_new_errors", checked_at)
    };
    gate.evidence_paths.push(paths::MYPY_RATCHET_STATUS.to_string());
    gate
}

fn gate_federation_snapshot(root: &Path, env: &Env, checked_at: &str) -> GateResult {
    let gate = federation_integrity_gate(root);
    match gate.get("status").and_then(Value::as_str) {
        Some("diverged") => {
            let enforce = env.flag("SENTIENTOS_FEDERATION_INTEGRITY_ENFORCE");
            GateResult::new(
                "federation_snapshot",
                if enforce { GateStatus::Fail } else { GateStatus::Warn },
                "federation_diverged",
                checked_at,
            )
        }
        Some("ok") => GateResult::new("federation_snapshot", GateStatus::Ok, "ok", checked_at),
        _ => GateResult::new(
            "federation_snapshot",
            GateStatus::Skipped,
            "no_peer_snapshot",
            checked_at,
        ),
    }
}

/// Fixed mapping from warn/fail gates to operator commands.
fn recommended_actions(gates: &[GateResult]) -> Vec<Value> {
    let mut actions = Vec::new();
    for gate in gates {
        if !matches!(gate.status, GateStatus::Warn | GateStatus::Fail) {
            continue;
        }
        let action = match gate.name {
            "audit_chain" => json!({"gate": gate.name, "kind": "command", "value": "forge audit-chain-doctor --diagnose-only"}),
            "receipt_chain" => json!({"gate": gate.name, "kind": "command", "value": "forge verify-receipt-chain --last 25"}),
            "receipt_anchors" => json!({"gate": gate.name, "kind": "command", "value": "forge verify-receipt-anchors --require-tip"}),
            _ => json!({"gate": gate.name, "kind": "note", "value": gate.reason}),
        };
        actions.push(action);
    }
    actions
}
