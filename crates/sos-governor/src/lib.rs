//! Deterministic proof-budget governor.
//!
//! Given recent router telemetry the governor decides effective `(K, M)`
//! budget values and appends a hash-chained pressure-state snapshot per run.
//! Identical inputs always produce identical decisions; the snapshot write is
//! the one place in the substrate where lock contention skips the write
//! instead of blocking, and the skip is recorded in the governor event.

use serde_json::{json, Map, Value};
use tracing::debug;

use sos_config::Env;

pub mod state_chain;

pub use state_chain::{save_pressure_state, verify_pressure_state_chain, PressureStateWrite};

pub const GOVERNOR_VERSION: &str = "v1";

pub const REASON_FORCED_MODE: &str = "forced_mode";
pub const REASON_INVALID_MODE_FALLBACK: &str = "invalid_mode_fallback";
pub const REASON_PROOF_BURN_SPIKE: &str = "proof_burn_spike";
pub const REASON_ESCALATION_CLUSTER: &str = "escalation_cluster";
pub const REASON_ADMISSIBLE_COLLAPSE: &str = "admissible_collapse";

/// Governor operating mode, tightening from left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorMode {
    Normal,
    Constrained,
    DiagnosticsOnly,
}

impl GovernorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernorMode::Normal => "normal",
            GovernorMode::Constrained => "constrained",
            GovernorMode::DiagnosticsOnly => "diagnostics_only",
        }
    }
}

/// Static governor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorConfig {
    pub configured_k: i64,
    pub configured_m: i64,
    pub max_k: i64,
    pub escalation_enabled: bool,
    /// Requested mode: `auto`, `normal`, `constrained`, `diagnostics_only`,
    /// or anything else (recorded as an invalid-mode fallback).
    pub mode: String,
    pub admissible_collapse_runs: i64,
    pub min_m: i64,
    pub diagnostics_k: i64,
    pub pressure_window: usize,
    pub proof_burn_spike_runs: i64,
    pub escalation_cluster_runs: i64,
}

impl GovernorConfig {
    pub fn from_env(env: &Env, configured_k: i64, configured_m: i64) -> Self {
        Self {
            configured_k: configured_k.max(1),
            configured_m: configured_m.max(1),
            max_k: env.int_or("SENTIENTOS_ROUTER_MAX_K", 9).max(1),
            escalation_enabled: env
                .get("SENTIENTOS_ROUTER_ESCALATE_ON_ALL_FAIL_A")
                .map(|raw| !matches!(raw, "0" | "false" | "False"))
                .unwrap_or(true),
            mode: env.str_or("SENTIENTOS_GOVERNOR_MODE", "auto").to_string(),
            admissible_collapse_runs: env
                .int_or("SENTIENTOS_GOVERNOR_ADMISSIBLE_COLLAPSE_RUNS", 3)
                .max(1),
            min_m: env.int_or("SENTIENTOS_GOVERNOR_MIN_M", 1).max(1),
            diagnostics_k: env.int_or("SENTIENTOS_GOVERNOR_DIAGNOSTICS_K", 4).max(1),
            pressure_window: 6,
            proof_burn_spike_runs: 2,
            escalation_cluster_runs: 2,
        }
    }
}

/// Rolling telemetry window consumed by budget decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PressureState {
    pub consecutive_no_admissible: i64,
    pub recent_runs: Vec<Value>,
}

impl PressureState {
    pub fn from_value(payload: &Value) -> Self {
        let consecutive = payload
            .get("consecutive_no_admissible")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0);
        let recent_runs = payload
            .get("recent_runs")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter(|item| item.is_object()).cloned().collect())
            .unwrap_or_default();
        Self {
            consecutive_no_admissible: consecutive,
            recent_runs,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "consecutive_no_admissible": self.consecutive_no_admissible,
            "recent_runs": self.recent_runs,
        })
    }
}

/// Run identity threaded through decisions and events.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub pipeline: String,
    pub capability: String,
    pub router_attempt: i64,
}

impl RunContext {
    fn pipeline_or_unknown(&self) -> &str {
        if self.pipeline.is_empty() {
            "unknown"
        } else {
            &self.pipeline
        }
    }

    fn capability_or_unknown(&self) -> &str {
        if self.capability.is_empty() {
            "unknown"
        } else {
            &self.capability
        }
    }
}

/// The governor's verdict for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetDecision {
    pub k_effective: i64,
    pub m_effective: i64,
    pub allow_escalation: bool,
    pub mode: GovernorMode,
    /// Sorted and de-duplicated, which makes equality (and determinism
    /// checks) total.
    pub decision_reasons: Vec<String>,
    pub governor_version: &'static str,
}

fn recent_window(state: &PressureState, window: usize) -> &[Value] {
    let runs = &state.recent_runs;
    if window == 0 || runs.len() <= window {
        runs
    } else {
        &runs[runs.len() - window..]
    }
}

/// Decide the effective budget. Total and deterministic: identical
/// `(config, pressure_state, run_context)` yield identical decisions.
pub fn decide_budget(
    config: &GovernorConfig,
    pressure_state: &PressureState,
    _run_context: &RunContext,
) -> BudgetDecision {
    let mut reasons: Vec<String> = Vec::new();
    let mut k_effective = config.configured_k;
    let mut m_effective = config.configured_m;
    let mut allow_escalation = config.escalation_enabled;
    let mut mode = GovernorMode::Normal;

    let recent = recent_window(pressure_state, config.pressure_window);
    let burn_spikes = recent
        .iter()
        .filter(|item| {
            item.get("proof_burn_spike")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .count() as i64;
    let escalation_runs = recent
        .iter()
        .filter(|item| item.get("escalated").and_then(Value::as_bool).unwrap_or(false))
        .count() as i64;

    let mut proof_burn_spike = burn_spikes >= config.proof_burn_spike_runs;
    let escalation_cluster = escalation_runs >= config.escalation_cluster_runs;
    let mut admissible_collapse =
        pressure_state.consecutive_no_admissible >= config.admissible_collapse_runs;

    match config.mode.trim().to_lowercase().as_str() {
        "diagnostics_only" => {
            admissible_collapse = true;
            reasons.push(REASON_FORCED_MODE.to_string());
        }
        "constrained" => {
            proof_burn_spike = true;
            reasons.push(REASON_FORCED_MODE.to_string());
        }
        "auto" | "normal" | "" => {}
        _ => reasons.push(REASON_INVALID_MODE_FALLBACK.to_string()),
    }

    if proof_burn_spike {
        m_effective = (config.configured_m - 1).max(config.min_m);
        allow_escalation = false;
        mode = GovernorMode::Constrained;
        reasons.push(REASON_PROOF_BURN_SPIKE.to_string());
    }

    if escalation_cluster {
        k_effective = k_effective.min(3);
        allow_escalation = false;
        if mode == GovernorMode::Normal {
            mode = GovernorMode::Constrained;
        }
        reasons.push(REASON_ESCALATION_CLUSTER.to_string());
    }

    if admissible_collapse {
        k_effective = k_effective.max(config.max_k.min(config.diagnostics_k));
        m_effective = 0;
        allow_escalation = false;
        mode = GovernorMode::DiagnosticsOnly;
        reasons.push(REASON_ADMISSIBLE_COLLAPSE.to_string());
    }

    reasons.sort();
    reasons.dedup();
    let decision = BudgetDecision {
        k_effective: k_effective.min(config.max_k).max(1),
        m_effective: m_effective.max(0),
        allow_escalation,
        mode,
        decision_reasons: reasons,
        governor_version: GOVERNOR_VERSION,
    };
    debug!(mode = decision.mode.as_str(), k = decision.k_effective, m = decision.m_effective, "governor decision");
    decision
}

/// Fold a run's outcome into the rolling window.
pub fn update_pressure_state(
    prior: &PressureState,
    decision: &BudgetDecision,
    router_telemetry: &Value,
    router_status: &str,
    run_context: &RunContext,
    config: &GovernorConfig,
) -> PressureState {
    let no_admissible = router_status != "selected";
    let consecutive_no_admissible = if no_admissible {
        prior.consecutive_no_admissible + 1
    } else {
        0
    };

    let event = json!({
        "pipeline": run_context.pipeline_or_unknown(),
        "capability": run_context.capability_or_unknown(),
        "router_attempt": run_context.router_attempt.max(1),
        "router_status": router_status,
        "mode": decision.mode.as_str(),
        "proof_burn_spike": decision
            .decision_reasons
            .iter()
            .any(|reason| reason == REASON_PROOF_BURN_SPIKE),
        "escalated": router_telemetry
            .get("escalated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        "stage_b_evaluations": router_telemetry
            .get("stage_b_evaluations")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    });

    let keep = config.pressure_window.saturating_sub(1);
    let mut recent: Vec<Value> = recent_window(prior, keep).to_vec();
    recent.push(event);
    PressureState {
        consecutive_no_admissible,
        recent_runs: recent,
    }
}

/// Amendment-log event for one governor run.
pub fn build_governor_event(
    decision: &BudgetDecision,
    run_context: &RunContext,
    router_telemetry: &Value,
    pressure_state_write: &PressureStateWrite,
) -> Value {
    json!({
        "event_type": "proof_budget_governor",
        "pipeline": run_context.pipeline_or_unknown(),
        "capability": run_context.capability_or_unknown(),
        "router_attempt": run_context.router_attempt.max(1),
        "governor": {
            "mode": decision.mode.as_str(),
            "k_effective": decision.k_effective,
            "m_effective": decision.m_effective,
            "allow_escalation": decision.allow_escalation,
            "reasons": decision.decision_reasons,
            "governor_version": decision.governor_version,
            "pressure_state_new_hash": pressure_state_write.new_hash.clone(),
            "state_update_skipped": pressure_state_write.state_update_skipped,
        },
        "router_telemetry": router_telemetry.as_object().cloned().map(Value::Object).unwrap_or_else(|| Value::Object(Map::new())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn config() -> GovernorConfig {
        GovernorConfig {
            configured_k: 5,
            configured_m: 3,
            max_k: 9,
            escalation_enabled: true,
            mode: "auto".to_string(),
            admissible_collapse_runs: 3,
            min_m: 1,
            diagnostics_k: 4,
            pressure_window: 6,
            proof_burn_spike_runs: 2,
            escalation_cluster_runs: 2,
        }
    }

    fn run_context() -> RunContext {
        RunContext {
            pipeline: "genesis".to_string(),
            capability: "vision".to_string(),
            router_attempt: 1,
        }
    }

    #[test]
    fn decision_is_deterministic_for_fixed_inputs() {
        let state = PressureState {
            consecutive_no_admissible: 1,
            recent_runs: vec![
                json!({"proof_burn_spike": true, "escalated": false}),
                json!({"proof_burn_spike": true, "escalated": true}),
            ],
        };
        let one = decide_budget(&config(), &state, &run_context());
        let two = decide_budget(&config(), &state, &run_context());
        assert_eq!(one, two);
    }

    #[test]
    fn proof_burn_spike_reduces_m_and_disables_escalation() {
        let state = PressureState {
            consecutive_no_admissible: 0,
            recent_runs: vec![
                json!({"proof_burn_spike": true, "escalated": false}),
                json!({"proof_burn_spike": true, "escalated": false}),
            ],
        };
        let decision = decide_budget(&config(), &state, &run_context());
        assert_eq!(decision.mode, GovernorMode::Constrained);
        assert_eq!(decision.m_effective, 2);
        assert!(!decision.allow_escalation);
        assert!(decision
            .decision_reasons
            .iter()
            .any(|r| r == REASON_PROOF_BURN_SPIKE));
    }

    #[test]
    fn escalation_cluster_caps_k() {
        let state = PressureState {
            consecutive_no_admissible: 0,
            recent_runs: vec![
                json!({"proof_burn_spike": false, "escalated": true}),
                json!({"proof_burn_spike": false, "escalated": true}),
            ],
        };
        let decision = decide_budget(&config(), &state, &run_context());
        assert_eq!(decision.k_effective, 3);
        assert_eq!(decision.mode, GovernorMode::Constrained);
        assert!(!decision.allow_escalation);
    }

    #[test]
    fn admissible_collapse_forces_diagnostics_only() {
        let state = PressureState {
            consecutive_no_admissible: 3,
            recent_runs: Vec::new(),
        };
        let decision = decide_budget(&config(), &state, &run_context());
        assert_eq!(decision.mode, GovernorMode::DiagnosticsOnly);
        assert_eq!(decision.m_effective, 0);
        assert!(decision.k_effective >= 4);
        assert!(!decision.allow_escalation);
        assert!(decision
            .decision_reasons
            .iter()
            .any(|r| r == REASON_ADMISSIBLE_COLLAPSE));
    }

    #[test]
    fn unknown_mode_records_fallback_and_stays_normal() {
        let mut cfg = config();
        cfg.mode = "sideways".to_string();
        let decision = decide_budget(&cfg, &PressureState::default(), &run_context());
        assert_eq!(decision.mode, GovernorMode::Normal);
        assert_eq!(decision.k_effective, 5);
        assert!(decision
            .decision_reasons
            .iter()
            .any(|r| r == REASON_INVALID_MODE_FALLBACK));
    }

    #[test]
    fn reasons_are_sorted_and_unique() {
        let mut cfg = config();
        cfg.mode = "constrained".to_string();
        let state = PressureState {
            consecutive_no_admissible: 9,
            recent_runs: vec![
                json!({"proof_burn_spike": true, "escalated": true}),
                json!({"proof_burn_spike": true, "escalated": true}),
            ],
        };
        let decision = decide_budget(&cfg, &state, &run_context());
        let mut sorted = decision.decision_reasons.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(decision.decision_reasons, sorted);
    }

    #[test]
    fn router_status_drives_no_admissible_counter() {
        let cfg = config();
        let decision = decide_budget(&cfg, &PressureState::default(), &run_context());
        let telemetry = json!({"escalated": false, "stage_b_evaluations": 1});

        let one = update_pressure_state(
            &PressureState::default(),
            &decision,
            &telemetry,
            "no_admissible",
            &run_context(),
            &cfg,
        );
        assert_eq!(one.consecutive_no_admissible, 1);
        assert_eq!(one.recent_runs.len(), 1);

        let two = update_pressure_state(&one, &decision, &telemetry, "selected", &run_context(), &cfg);
        assert_eq!(two.consecutive_no_admissible, 0);
        assert_eq!(two.recent_runs.len(), 2);
    }

    #[test]
    fn window_truncates_to_configured_size() {
        let cfg = config();
        let decision = decide_budget(&cfg, &PressureState::default(), &run_context());
        let telemetry = json!({});
        let mut state = PressureState::default();
        for _ in 0..10 {
            state = update_pressure_state(&state, &decision, &telemetry, "selected", &run_context(), &cfg);
        }
        assert_eq!(state.recent_runs.len(), cfg.pressure_window);
    }
}
