//! Integrity pressure derived from the incident feed.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use sos_chain::io;
use sos_config::{paths, Env};

use crate::posture::{derived_thresholds, resolve_posture, StrategicPosture};

const WARN_BASE: i64 = 3;
const ENFORCE_BASE: i64 = 7;
const CRITICAL_BASE: i64 = 12;

/// Incident metrics over the trailing windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressureMetrics {
    pub incidents_last_1h: i64,
    pub incidents_last_24h: i64,
    pub enforced_failures_last_24h: i64,
    pub unique_trigger_types_last_24h: i64,
    pub quarantine_activations_last_24h: i64,
}

impl PressureMetrics {
    pub fn to_value(&self) -> Value {
        json!({
            "incidents_last_1h": self.incidents_last_1h,
            "incidents_last_24h": self.incidents_last_24h,
            "enforced_failures_last_24h": self.enforced_failures_last_24h,
            "unique_trigger_types_last_24h": self.unique_trigger_types_last_24h,
            "quarantine_activations_last_24h": self.quarantine_activations_last_24h,
        })
    }

    /// Pressure score feeding the level thresholds.
    pub fn score(&self) -> i64 {
        self.incidents_last_24h
            + self.enforced_failures_last_24h
            + self.quarantine_activations_last_24h
            + self.unique_trigger_types_last_24h
    }
}

/// One pressure evaluation.
#[derive(Debug, Clone)]
pub struct PressureSnapshot {
    pub level: i64,
    pub metrics: PressureMetrics,
    pub warn_threshold: i64,
    pub enforce_threshold: i64,
    pub critical_threshold: i64,
    pub strategic_posture: String,
    pub checked_at: String,
}

impl PressureSnapshot {
    pub fn summary(&self) -> Value {
        json!({
            "level": self.level,
            "metrics": self.metrics.to_value(),
        })
    }
}

/// Compute the current pressure level from `pulse/integrity_incidents.jsonl`.
pub fn compute_integrity_pressure(root: &Path, env: &Env, now: DateTime<Utc>) -> PressureSnapshot {
    let rows = io::read_jsonl(&root.join(paths::INCIDENT_FEED));
    let one_hour_ago = now - Duration::hours(1);
    let one_day_ago = now - Duration::hours(24);

    let mut metrics = PressureMetrics {
        incidents_last_1h: 0,
        incidents_last_24h: 0,
        enforced_failures_last_24h: 0,
        unique_trigger_types_last_24h: 0,
        quarantine_activations_last_24h: 0,
    };
    let mut unique_triggers = std::collections::BTreeSet::new();
    for row in &rows {
        let Some(created_at) = row
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_iso)
        else {
            continue;
        };
        if created_at >= one_hour_ago {
            metrics.incidents_last_1h += 1;
        }
        if created_at < one_day_ago {
            continue;
        }
        metrics.incidents_last_24h += 1;
        if row
            .get("enforcement_mode")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .as_deref()
            == Some("enforce")
        {
            metrics.enforced_failures_last_24h += 1;
        }
        if row
            .get("quarantine_activated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            metrics.quarantine_activations_last_24h += 1;
        }
        if let Some(triggers) = row.get("triggers").and_then(Value::as_array) {
            for trigger in triggers {
                if let Some(name) = trigger.as_str().filter(|s| !s.is_empty()) {
                    unique_triggers.insert(name.to_string());
                }
            }
        }
    }
    metrics.unique_trigger_types_last_24h = unique_triggers.len() as i64;

    let posture = resolve_posture(env);
    let (warn_default, enforce_default, critical_default) =
        derived_thresholds(&posture, WARN_BASE, ENFORCE_BASE, CRITICAL_BASE);
    let warn_threshold = env_threshold(env, "SENTIENTOS_PRESSURE_WARN_THRESHOLD", warn_default);
    let enforce_threshold =
        env_threshold(env, "SENTIENTOS_PRESSURE_ENFORCE_THRESHOLD", enforce_default);
    let critical_threshold =
        env_threshold(env, "SENTIENTOS_PRESSURE_CRITICAL_THRESHOLD", critical_default);

    let score = metrics.score();
    let level = if score >= critical_threshold {
        3
    } else if score >= enforce_threshold {
        2
    } else if score >= warn_threshold {
        1
    } else {
        0
    };
    debug!(level, score, "computed integrity pressure");

    PressureSnapshot {
        level,
        metrics,
        warn_threshold,
        enforce_threshold,
        critical_threshold,
        strategic_posture: posture.posture.as_str().to_string(),
        checked_at: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

fn env_threshold(env: &Env, name: &str, default: i64) -> i64 {
    env.int_override(name).map(|v| v.max(0)).unwrap_or(default)
}

fn escalation_disabled(env: &Env) -> bool {
    env.flag("SENTIENTOS_PRESSURE_DISABLE_ESCALATION")
}

/// Escalate per-gate severity from the pressure level.
pub fn apply_escalation(
    env: &Env,
    posture: &StrategicPosture,
    level: i64,
    base_enforce: bool,
    base_warn: bool,
    high_severity: bool,
) -> (bool, bool) {
    if escalation_disabled(env) {
        return (base_enforce, base_warn);
    }
    let warn = base_warn || level >= 1;
    let enforce = base_enforce || (level >= posture.high_severity_enforce_level && high_severity);
    (enforce, warn)
}

/// Pressure alone can force quarantine once it crosses the posture's bar.
pub fn should_force_quarantine(env: &Env, posture: &StrategicPosture, level: i64) -> bool {
    !escalation_disabled(env) && level >= posture.quarantine_force_level
}

/// Persist level / posture transitions; returns `(state, changed)`.
pub fn update_pressure_level(
    root: &Path,
    snapshot: &PressureSnapshot,
) -> Result<(Value, bool), sos_chain::ChainError> {
    let state_path = root.join(paths::PRESSURE_LEVEL_STATE);
    let mut state = io::read_json(&state_path).unwrap_or_else(|| {
        json!({
            "schema_version": 1,
            "level": 0,
            "strategic_posture": "balanced",
            "last_pressure_change_at": null,
            "posture_last_changed_at": null,
        })
    });

    let level_changed = state.get("level").and_then(Value::as_i64) != Some(snapshot.level);
    let posture_changed = state.get("strategic_posture").and_then(Value::as_str)
        != Some(snapshot.strategic_posture.as_str());
    if level_changed {
        state["level"] = json!(snapshot.level);
        state["last_pressure_change_at"] = json!(snapshot.checked_at);
    }
    if posture_changed {
        state["strategic_posture"] = json!(snapshot.strategic_posture);
        state["posture_last_changed_at"] = json!(snapshot.checked_at);
    }
    if level_changed || posture_changed {
        io::write_json_atomic(&state_path, &state)?;
    }
    Ok((state, level_changed || posture_changed))
}

fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn incident_row(created_at: &str, enforce: bool, quarantined: bool, triggers: &[&str]) -> Value {
        json!({
            "created_at": created_at,
            "enforcement_mode": if enforce { "enforce" } else { "warn" },
            "quarantine_activated": quarantined,
            "triggers": triggers,
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap()
    }

    fn seed_feed(root: &Path, rows: &[Value]) {
        for row in rows {
            io::append_jsonl(&root.join(paths::INCIDENT_FEED), row).unwrap();
        }
    }

    #[test]
    fn empty_feed_is_level_zero() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        assert_eq!(snapshot.level, 0);
        assert_eq!(snapshot.metrics.score(), 0);
    }

    #[test]
    fn exactly_at_warn_threshold_is_level_one() {
        let dir = tempfile::tempdir().unwrap();
        // score = 2 incidents + 1 unique trigger = 3 == balanced warn threshold
        seed_feed(
            dir.path(),
            &[
                incident_row("2026-01-02T11:00:00Z", false, false, &["receipt_chain"]),
                incident_row("2026-01-02T11:30:00Z", false, false, &["receipt_chain"]),
            ],
        );
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        assert_eq!(snapshot.metrics.score(), 3);
        assert_eq!(snapshot.warn_threshold, 3);
        assert_eq!(snapshot.level, 1);
    }

    #[test]
    fn enforced_quarantining_incidents_reach_critical() {
        let dir = tempfile::tempdir().unwrap();
        seed_feed(
            dir.path(),
            &[
                incident_row("2026-01-02T10:00:00Z", true, true, &["audit_chain"]),
                incident_row("2026-01-02T10:30:00Z", true, true, &["receipt_chain"]),
                incident_row("2026-01-02T11:00:00Z", true, true, &["doctrine_identity"]),
            ],
        );
        // score = 3 incidents + 3 enforced + 3 activations + 3 triggers = 12
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        assert!(snapshot.metrics.score() >= snapshot.enforce_threshold);
        assert_eq!(snapshot.level, 3);
    }

    #[test]
    fn old_incidents_age_out_of_the_window() {
        let dir = tempfile::tempdir().unwrap();
        seed_feed(
            dir.path(),
            &[incident_row("2025-12-01T00:00:00Z", true, true, &["stale"])],
        );
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        assert_eq!(snapshot.level, 0);
        assert_eq!(snapshot.metrics.incidents_last_24h, 0);
    }

    #[test]
    fn env_override_wins_over_posture_default() {
        let dir = tempfile::tempdir().unwrap();
        seed_feed(
            dir.path(),
            &[incident_row("2026-01-02T11:00:00Z", false, false, &["t"])],
        );
        let env = Env::from_pairs([("SENTIENTOS_PRESSURE_WARN_THRESHOLD", "1")]);
        let snapshot = compute_integrity_pressure(dir.path(), &env, now());
        assert_eq!(snapshot.warn_threshold, 1);
        assert_eq!(snapshot.level, 1);
    }

    #[test]
    fn escalation_disable_freezes_semantics() {
        let env = Env::from_pairs([("SENTIENTOS_PRESSURE_DISABLE_ESCALATION", "1")]);
        let posture = resolve_posture(&env);
        assert_eq!(
            apply_escalation(&env, &posture, 3, false, false, true),
            (false, false)
        );
        assert!(!should_force_quarantine(&env, &posture, 3));

        let live = Env::default();
        let posture = resolve_posture(&live);
        let (enforce, warn) = apply_escalation(&live, &posture, 2, false, false, true);
        assert!(warn);
        assert!(enforce);
        assert!(should_force_quarantine(&live, &posture, 3));
    }

    #[test]
    fn pressure_level_state_persists_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        let (_, changed) = update_pressure_level(dir.path(), &snapshot).unwrap();
        // First write records the balanced/0 state baseline.
        assert!(!changed);

        seed_feed(
            dir.path(),
            &[
                incident_row("2026-01-02T11:00:00Z", false, false, &["a"]),
                incident_row("2026-01-02T11:10:00Z", false, false, &["b"]),
            ],
        );
        let snapshot = compute_integrity_pressure(dir.path(), &Env::default(), now());
        let (state, changed) = update_pressure_level(dir.path(), &snapshot).unwrap();
        assert!(changed);
        assert_eq!(state["level"], json!(1));
        assert_eq!(state["last_pressure_change_at"], json!(snapshot.checked_at));
    }
}
