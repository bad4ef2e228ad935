//! Proof-budget governor driver.
//!
//! Called once per routed run by the external router glue: decides the
//! effective `(K, M)` budget, folds the run into the pressure window, writes
//! the chained snapshot (or records the skip), and appends the amendment-log
//! event.

use serde_json::Value;
use tracing::info;

use sos_config::paths;
use sos_governor::state_chain::{append_amendment_event, load_pressure_state};
use sos_governor::{
    build_governor_event, decide_budget, save_pressure_state, update_pressure_state,
    BudgetDecision, GovernorConfig, RunContext,
};

use crate::{CoreContext, CoreError};

/// One governor run's outputs.
#[derive(Debug, Clone)]
pub struct GovernorRun {
    pub decision: BudgetDecision,
    pub event: Value,
    pub state_update_skipped: bool,
}

/// Run the governor against the repository's pressure-state chain.
pub fn run_proof_budget_governor(
    ctx: &CoreContext,
    configured_k: i64,
    configured_m: i64,
    router_status: &str,
    router_telemetry: &Value,
    run_context: &RunContext,
) -> Result<GovernorRun, CoreError> {
    let config = GovernorConfig::from_env(&ctx.env, configured_k, configured_m);
    let state_dir = ctx.root.join(paths::GOVERNOR_STATE_DIR);

    let prior = load_pressure_state(&state_dir);
    let decision = decide_budget(&config, &prior, run_context);
    let next = update_pressure_state(
        &prior,
        &decision,
        router_telemetry,
        router_status,
        run_context,
        &config,
    );
    let write = save_pressure_state(&next, &state_dir)?;
    let event = build_governor_event(&decision, run_context, router_telemetry, &write);
    append_amendment_event(&ctx.root, event.clone())?;
    info!(
        mode = decision.mode.as_str(),
        k = decision.k_effective,
        m = decision.m_effective,
        skipped = write.state_update_skipped,
        "governor run recorded"
    );
    Ok(GovernorRun {
        decision,
        event,
        state_update_skipped: write.state_update_skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sos_chain::io;
    use sos_config::Env;
    use sos_governor::verify_pressure_state_chain;

    fn run_once(ctx: &CoreContext, status: &str) -> GovernorRun {
        run_proof_budget_governor(
            ctx,
            5,
            3,
            status,
            &json!({"escalated": false, "stage_b_evaluations": 1}),
            &RunContext {
                pipeline: "genesis".to_string(),
                capability: "vision".to_string(),
                router_attempt: 1,
            },
        )
        .unwrap()
    }

    #[test]
    fn governor_runs_chain_snapshots_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::with_env(dir.path(), Env::default());

        for _ in 0..3 {
            let run = run_once(&ctx, "selected");
            assert!(!run.state_update_skipped);
        }

        let state_dir = dir.path().join(paths::GOVERNOR_STATE_DIR);
        let events = dir.path().join(paths::AMENDMENT_LOG);
        let result = verify_pressure_state_chain(&state_dir, Some(&events));
        assert_eq!(result["integrity_ok"], json!(true), "issues: {}", result["issues"]);
        assert_eq!(result["snapshot_count"], json!(3));
        assert_eq!(io::read_jsonl(&events).len(), 3);
    }

    #[test]
    fn repeated_no_admissible_runs_collapse_to_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::with_env(dir.path(), Env::default());

        // Three failed runs accumulate the counter; the fourth decision sees
        // the collapse threshold crossed.
        let mut last = run_once(&ctx, "no_admissible");
        for _ in 0..3 {
            last = run_once(&ctx, "no_admissible");
        }
        assert_eq!(last.decision.mode.as_str(), "diagnostics_only");
        assert_eq!(last.decision.m_effective, 0);
        assert!(!last.decision.allow_escalation);
        assert_eq!(
            last.event["governor"]["mode"],
            json!("diagnostics_only")
        );
    }
}
