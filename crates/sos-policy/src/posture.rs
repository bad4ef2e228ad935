//! Strategic posture: the top-level policy dial.

use sos_config::Env;

/// Posture selected via `SENTIENTOS_POSTURE`; unknown values fall back to
/// `balanced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostureName {
    Stability,
    Balanced,
    Velocity,
}

impl PostureName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostureName::Stability => "stability",
            PostureName::Balanced => "balanced",
            PostureName::Velocity => "velocity",
        }
    }
}

/// Threshold multipliers and default toggles for one posture.
#[derive(Debug, Clone)]
pub struct StrategicPosture {
    pub posture: PostureName,
    pub warn_multiplier: f64,
    pub enforce_multiplier: f64,
    pub critical_multiplier: f64,
    pub throughput_cautious_level: i64,
    pub throughput_recovery_level: i64,
    pub throughput_lockdown_level: i64,
    pub high_severity_enforce_level: i64,
    pub quarantine_auto_sensitivity: Sensitivity,
    pub quarantine_force_level: i64,
    pub default_automerge_enabled: bool,
    pub default_federation_enforce: bool,
    pub default_audit_strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Strict,
    Balanced,
    Lenient,
}

const STABILITY: StrategicPosture = StrategicPosture {
    posture: PostureName::Stability,
    warn_multiplier: 0.8,
    enforce_multiplier: 0.8,
    critical_multiplier: 0.8,
    throughput_cautious_level: 1,
    throughput_recovery_level: 2,
    throughput_lockdown_level: 2,
    high_severity_enforce_level: 1,
    quarantine_auto_sensitivity: Sensitivity::Strict,
    quarantine_force_level: 2,
    default_automerge_enabled: true,
    default_federation_enforce: true,
    default_audit_strict: true,
};

const BALANCED: StrategicPosture = StrategicPosture {
    posture: PostureName::Balanced,
    warn_multiplier: 1.0,
    enforce_multiplier: 1.0,
    critical_multiplier: 1.0,
    throughput_cautious_level: 1,
    throughput_recovery_level: 2,
    throughput_lockdown_level: 3,
    high_severity_enforce_level: 2,
    quarantine_auto_sensitivity: Sensitivity::Balanced,
    quarantine_force_level: 3,
    default_automerge_enabled: true,
    default_federation_enforce: false,
    default_audit_strict: false,
};

const VELOCITY: StrategicPosture = StrategicPosture {
    posture: PostureName::Velocity,
    warn_multiplier: 1.3,
    enforce_multiplier: 1.3,
    critical_multiplier: 1.3,
    throughput_cautious_level: 2,
    throughput_recovery_level: 3,
    throughput_lockdown_level: 4,
    high_severity_enforce_level: 3,
    quarantine_auto_sensitivity: Sensitivity::Lenient,
    quarantine_force_level: 4,
    default_automerge_enabled: true,
    default_federation_enforce: false,
    default_audit_strict: false,
};

/// Resolve the active posture from the environment snapshot.
pub fn resolve_posture(env: &Env) -> StrategicPosture {
    match env.str_or("SENTIENTOS_POSTURE", "balanced").trim().to_lowercase().as_str() {
        "stability" => STABILITY,
        "velocity" => VELOCITY,
        _ => BALANCED,
    }
}

/// Posture-scaled threshold, never below 1.
pub fn scaled_threshold(base: i64, multiplier: f64) -> i64 {
    ((base as f64 * multiplier).ceil() as i64).max(1)
}

/// Derived `(warn, enforce, critical)` thresholds with strict ordering:
/// `enforce ≥ warn + 1`, `critical ≥ enforce + 1`.
pub fn derived_thresholds(
    posture: &StrategicPosture,
    warn_base: i64,
    enforce_base: i64,
    critical_base: i64,
) -> (i64, i64, i64) {
    let warn = scaled_threshold(warn_base, posture.warn_multiplier);
    let enforce = scaled_threshold(enforce_base, posture.enforce_multiplier).max(warn + 1);
    let critical = scaled_threshold(critical_base, posture.critical_multiplier).max(enforce + 1);
    (warn, enforce, critical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_posture_falls_back_to_balanced() {
        let env = Env::from_pairs([("SENTIENTOS_POSTURE", "yolo")]);
        assert_eq!(resolve_posture(&env).posture, PostureName::Balanced);
    }

    #[test]
    fn stability_tightens_thresholds() {
        let env = Env::from_pairs([("SENTIENTOS_POSTURE", "stability")]);
        let posture = resolve_posture(&env);
        let (warn, enforce, critical) = derived_thresholds(&posture, 3, 7, 12);
        assert_eq!((warn, enforce, critical), (3, 6, 10));
    }

    #[test]
    fn thresholds_stay_strictly_ordered() {
        let env = Env::from_pairs([("SENTIENTOS_POSTURE", "velocity")]);
        let posture = resolve_posture(&env);
        let (warn, enforce, critical) = derived_thresholds(&posture, 1, 1, 1);
        assert!(warn < enforce && enforce < critical);
    }
}
