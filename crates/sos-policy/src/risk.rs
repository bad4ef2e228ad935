//! Per-tick risk budget caps.

use serde_json::{json, Value};

use sos_config::Env;

use crate::posture::{PostureName, StrategicPosture};
use crate::throughput::OperatingMode;

/// Integer caps for one tick. Base values come from the forge governor's
/// environment knobs and are tightened by posture, pressure, mode, and
/// quarantine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskBudget {
    pub forge_max_runs_per_day: i64,
    pub forge_max_runs_per_hour: i64,
    pub forge_max_files_changed: i64,
    pub forge_max_retries: i64,
}

impl RiskBudget {
    pub fn summary(&self) -> Value {
        json!({
            "max_runs_per_day": self.forge_max_runs_per_day,
            "max_runs_per_hour": self.forge_max_runs_per_hour,
            "max_files_changed": self.forge_max_files_changed,
            "max_retries": self.forge_max_retries,
        })
    }
}

/// Compute the tick's caps.
///
/// Lockdown and active quarantine force zero-run / zero-file budgets; the
/// integrity controller additionally requires `forge_max_files_changed > 0`
/// before allowing mutation.
pub fn compute_risk_budget(
    env: &Env,
    posture: &StrategicPosture,
    pressure_level: i64,
    mode: OperatingMode,
    quarantine_active: bool,
) -> RiskBudget {
    let base_runs_per_day = env.int_or("SENTIENTOS_FORGE_MAX_RUNS_PER_DAY", 2).max(1);
    let base_runs_per_hour = env.int_or("SENTIENTOS_FORGE_MAX_RUNS_PER_HOUR", 1).max(1);
    let base_files = env
        .int_or("SENTIENTOS_FORGE_MAX_FILES_CHANGED_PER_DAY", 200)
        .max(1);
    let base_retries = env.int_or("SENTIENTOS_FORGE_MAX_RETRIES", 1).max(0);

    if mode == OperatingMode::Lockdown || quarantine_active {
        return RiskBudget {
            forge_max_runs_per_day: 0,
            forge_max_runs_per_hour: 0,
            forge_max_files_changed: 0,
            forge_max_retries: 0,
        };
    }

    let files_posture_scaled = match posture.posture {
        PostureName::Stability => (base_files + 1) / 2,
        PostureName::Balanced => base_files,
        PostureName::Velocity => base_files + base_files / 2,
    };

    let (runs_per_day, runs_per_hour, files, retries) = match pressure_level {
        0 => (
            base_runs_per_day,
            base_runs_per_hour,
            files_posture_scaled,
            base_retries,
        ),
        1 => (
            base_runs_per_day,
            base_runs_per_hour,
            (files_posture_scaled + 1) / 2,
            base_retries,
        ),
        2 => (1, 1, (files_posture_scaled + 3) / 4, base_retries.min(1)),
        _ => (0, 0, 0, 0),
    };

    let files = if mode == OperatingMode::Recovery { 0 } else { files };

    RiskBudget {
        forge_max_runs_per_day: runs_per_day,
        forge_max_runs_per_hour: runs_per_hour,
        forge_max_files_changed: files,
        forge_max_retries: retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posture::resolve_posture;

    fn balanced() -> StrategicPosture {
        resolve_posture(&Env::default())
    }

    #[test]
    fn calm_tick_uses_base_caps() {
        let budget = compute_risk_budget(
            &Env::default(),
            &balanced(),
            0,
            OperatingMode::Normal,
            false,
        );
        assert_eq!(budget.forge_max_runs_per_day, 2);
        assert_eq!(budget.forge_max_runs_per_hour, 1);
        assert_eq!(budget.forge_max_files_changed, 200);
        assert_eq!(budget.forge_max_retries, 1);
    }

    #[test]
    fn lockdown_zeroes_every_cap() {
        let budget = compute_risk_budget(
            &Env::default(),
            &balanced(),
            0,
            OperatingMode::Lockdown,
            false,
        );
        assert_eq!(budget.forge_max_files_changed, 0);
        assert_eq!(budget.forge_max_runs_per_day, 0);
    }

    #[test]
    fn quarantine_zeroes_caps_regardless_of_mode() {
        let budget = compute_risk_budget(
            &Env::default(),
            &balanced(),
            0,
            OperatingMode::Normal,
            true,
        );
        assert_eq!(budget.forge_max_files_changed, 0);
    }

    #[test]
    fn pressure_tightens_file_caps() {
        let level_one = compute_risk_budget(
            &Env::default(),
            &balanced(),
            1,
            OperatingMode::Cautious,
            false,
        );
        assert_eq!(level_one.forge_max_files_changed, 100);
        let level_two = compute_risk_budget(
            &Env::default(),
            &balanced(),
            2,
            OperatingMode::Cautious,
            false,
        );
        assert_eq!(level_two.forge_max_files_changed, 50);
        assert_eq!(level_two.forge_max_runs_per_day, 1);
    }

    #[test]
    fn recovery_mode_blocks_file_changes() {
        let budget = compute_risk_budget(
            &Env::default(),
            &balanced(),
            2,
            OperatingMode::Recovery,
            false,
        );
        assert_eq!(budget.forge_max_files_changed, 0);
    }

    #[test]
    fn env_caps_are_respected() {
        let env = Env::from_pairs([("SENTIENTOS_FORGE_MAX_FILES_CHANGED_PER_DAY", "40")]);
        let budget = compute_risk_budget(&env, &balanced(), 0, OperatingMode::Normal, false);
        assert_eq!(budget.forge_max_files_changed, 40);
    }
}
