//! Hash-chained pressure-state snapshots.
//!
//! Snapshots live under `<state_dir>/snapshots/` with `latest.json` pointing
//! at the tip. The writer takes the directory lock non-blocking: a contended
//! lock skips the write entirely and the caller records the skip in the
//! governor event. Skipping is correctness-preserving here and nowhere else.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use sos_chain::{io, ChainError, FileLock};
use sos_config::paths;
use sos_enc::{compute_chained_hash, GENESIS_MARKER, HASH_ALGO};

use crate::{PressureState, GOVERNOR_VERSION};

/// Result of attempting a pressure-state write.
#[derive(Debug, Clone)]
pub struct PressureStateWrite {
    pub state_update_skipped: bool,
    pub new_hash: Option<String>,
    pub snapshot_path: Option<String>,
}

impl PressureStateWrite {
    fn skipped() -> Self {
        Self {
            state_update_skipped: true,
            new_hash: None,
            snapshot_path: None,
        }
    }
}

/// Load the tip pressure state from `latest.json`.
pub fn load_pressure_state(state_dir: &Path) -> PressureState {
    io::read_json(&state_dir.join("latest.json"))
        .and_then(|payload| payload.get("state").cloned())
        .map(|state| PressureState::from_value(&state))
        .unwrap_or_default()
}

/// Persist a new snapshot, or skip when the lock is contended.
pub fn save_pressure_state(
    state: &PressureState,
    state_dir: &Path,
) -> Result<PressureStateWrite, ChainError> {
    std::fs::create_dir_all(state_dir)?;
    let Some(_guard) = FileLock::try_acquire(&state_dir.join(".lock"))? else {
        warn!(dir = %state_dir.display(), "pressure-state lock contended, skipping write");
        return Ok(PressureStateWrite::skipped());
    };

    let latest_path = state_dir.join("latest.json");
    let prev_state_hash = io::read_json(&latest_path)
        .and_then(|latest| latest.get("state_hash").and_then(Value::as_str).map(str::to_string));

    let created_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut payload = json!({
        "schema_version": 1,
        "created_at": created_at,
        "governor_version": GOVERNOR_VERSION,
        "hash_algo": HASH_ALGO,
        "state": state.to_value(),
        "prev_state_hash": prev_state_hash.clone().unwrap_or_else(|| GENESIS_MARKER.to_string()),
    });
    let state_hash = compute_chained_hash(&payload, prev_state_hash.as_deref(), &["state_hash"])?;
    payload["state_hash"] = json!(state_hash);

    let snapshots_dir = state_dir.join("snapshots");
    let seq = snapshot_count(&snapshots_dir);
    let file_name = format!(
        "{}_{:04}_{}.json",
        created_at.replace([':', '.'], "-"),
        seq,
        sos_enc::short_hash(&state_hash),
    );
    io::write_json_atomic(&snapshots_dir.join(&file_name), &payload)?;
    io::write_json_atomic(&latest_path, &payload)?;
    debug!(hash = %state_hash, "pressure-state snapshot written");

    Ok(PressureStateWrite {
        state_update_skipped: false,
        new_hash: Some(state_hash),
        snapshot_path: Some(format!("snapshots/{file_name}")),
    })
}

fn snapshot_count(snapshots_dir: &Path) -> usize {
    std::fs::read_dir(snapshots_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_string_lossy()
                        .ends_with(".json")
                })
                .count()
        })
        .unwrap_or(0)
}

/// Walk the snapshot chain and cross-check the governor event log.
pub fn verify_pressure_state_chain(state_dir: &Path, events_path: Option<&Path>) -> Value {
    let snapshots_dir = state_dir.join("snapshots");
    let latest_path = state_dir.join("latest.json");
    let mut issues: Vec<String> = Vec::new();

    let Ok(read_dir) = std::fs::read_dir(&snapshots_dir) else {
        return json!({
            "integrity_ok": false,
            "issues": ["missing snapshots directory"],
            "snapshot_count": 0,
        });
    };
    let mut names: Vec<String> = read_dir
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".json"))
        .collect();
    names.sort();
    if names.is_empty() {
        return json!({
            "integrity_ok": false,
            "issues": ["no snapshots found"],
            "snapshot_count": 0,
        });
    }

    let mut prev_hash: Option<String> = None;
    let mut observed_hashes: std::collections::BTreeSet<String> = Default::default();
    for (index, name) in names.iter().enumerate() {
        let Some(payload) = io::read_json(&snapshots_dir.join(name)) else {
            issues.push(format!("{name}: invalid json"));
            continue;
        };

        if payload.get("hash_algo").and_then(Value::as_str) != Some(HASH_ALGO) {
            issues.push(format!("{name}: hash_algo mismatch"));
        }

        let declared_prev = payload.get("prev_state_hash").and_then(Value::as_str);
        if index == 0 {
            if declared_prev != Some(GENESIS_MARKER) {
                issues.push(format!("{name}: first prev_state_hash must be GENESIS"));
            }
        } else if declared_prev != prev_hash.as_deref() {
            issues.push(format!(
                "{name}: prev_state_hash mismatch expected {:?} got {:?}",
                prev_hash, declared_prev
            ));
        }

        let Some(declared_hash) = payload
            .get("state_hash")
            .and_then(Value::as_str)
            .filter(|hash| !hash.is_empty())
        else {
            issues.push(format!("{name}: missing state_hash"));
            prev_hash = None;
            continue;
        };

        let chain_prev = declared_prev.filter(|prev| *prev != GENESIS_MARKER);
        match compute_chained_hash(&payload, chain_prev, &["state_hash"]) {
            Ok(expected) if expected == declared_hash => {}
            Ok(_) => issues.push(format!("{name}: state_hash mismatch")),
            Err(err) => issues.push(format!("{name}: {err}")),
        }

        observed_hashes.insert(declared_hash.to_string());
        prev_hash = Some(declared_hash.to_string());
    }

    match io::read_json(&latest_path) {
        Some(latest) => {
            let latest_hash = latest.get("state_hash").and_then(Value::as_str);
            if latest_hash.is_some() && latest_hash != prev_hash.as_deref() {
                issues.push("latest.json state_hash does not match newest snapshot".to_string());
            }
        }
        None => issues.push("missing latest.json".to_string()),
    }

    if let Some(events) = events_path {
        cross_check_events(events, &observed_hashes, &mut issues);
    }

    json!({
        "integrity_ok": issues.is_empty(),
        "issues": issues,
        "snapshot_count": names.len(),
    })
}

fn cross_check_events(
    events_path: &Path,
    observed_hashes: &std::collections::BTreeSet<String>,
    issues: &mut Vec<String>,
) {
    let Ok(text) = std::fs::read_to_string(events_path) else {
        return;
    };
    for (line_no, line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            issues.push(format!("events line {line_no}: invalid json"));
            continue;
        };
        let Some(metadata) = event.get("metadata").filter(|m| m.is_object()) else {
            continue;
        };
        if metadata.get("event_type").and_then(Value::as_str) != Some("proof_budget_governor") {
            continue;
        }
        let Some(governor) = metadata.get("governor").filter(|g| g.is_object()) else {
            issues.push(format!("events line {line_no}: missing governor payload"));
            continue;
        };
        if governor
            .get("state_update_skipped")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            continue;
        }
        match governor.get("pressure_state_new_hash").and_then(Value::as_str) {
            Some(hash) if observed_hashes.contains(hash) => {}
            Some(_) => issues.push(format!(
                "events line {line_no}: referenced pressure_state_new_hash not found"
            )),
            None => issues.push(format!(
                "events line {line_no}: missing pressure_state_new_hash"
            )),
        }
    }
}

/// Append a governor event as an amendment-log row.
pub fn append_amendment_event(root: &Path, metadata: Value) -> Result<(), ChainError> {
    let row = json!({
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "proposal_id": format!("gov-{}", Uuid::new_v4()),
        "metadata": metadata,
    });
    io::append_jsonl(&root.join(paths::AMENDMENT_LOG), &row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        build_governor_event, decide_budget, update_pressure_state, GovernorConfig, RunContext,
    };

    fn config() -> GovernorConfig {
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

    fn next_state(prior: &PressureState, status: &str) -> PressureState {
        let cfg = config();
        let run_context = RunContext {
            pipeline: "genesis".to_string(),
            capability: "vision".to_string(),
            router_attempt: 1,
        };
        let decision = decide_budget(&cfg, prior, &run_context);
        update_pressure_state(
            prior,
            &decision,
            &json!({"escalated": false, "stage_b_evaluations": 1}),
            status,
            &run_context,
            &cfg,
        )
    }

    #[test]
    fn snapshot_sequence_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("pressure_state");
        let mut state = PressureState::default();
        for _ in 0..3 {
            state = next_state(&state, "selected");
            let write = save_pressure_state(&state, &state_dir).unwrap();
            assert!(!write.state_update_skipped);
            assert!(write.new_hash.is_some());
        }
        let result = verify_pressure_state_chain(&state_dir, None);
        assert_eq!(result["integrity_ok"], json!(true));
        assert_eq!(result["snapshot_count"], json!(3));
        assert_eq!(load_pressure_state(&state_dir), state);
    }

    #[test]
    fn mutated_snapshot_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("pressure_state");
        let mut state = PressureState::default();
        for _ in 0..2 {
            state = next_state(&state, "selected");
            save_pressure_state(&state, &state_dir).unwrap();
        }

        let snapshots_dir = state_dir.join("snapshots");
        let mut names: Vec<_> = std::fs::read_dir(&snapshots_dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        names.sort();
        let target = names.last().unwrap();
        let mut payload = io::read_json(target).unwrap();
        payload["state"]["consecutive_no_admissible"] = json!(999);
        io::write_json_atomic(target, &payload).unwrap();

        let result = verify_pressure_state_chain(&state_dir, None);
        assert_eq!(result["integrity_ok"], json!(false));
        let issues = result["issues"].as_array().unwrap();
        assert!(issues
            .iter()
            .any(|issue| issue.as_str().unwrap().contains("state_hash mismatch")));
    }

    #[test]
    fn missing_middle_snapshot_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("pressure_state");
        let mut state = PressureState::default();
        for _ in 0..3 {
            state = next_state(&state, "selected");
            save_pressure_state(&state, &state_dir).unwrap();
        }

        let mut names: Vec<_> = std::fs::read_dir(state_dir.join("snapshots"))
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        names.sort();
        std::fs::remove_file(&names[1]).unwrap();

        let result = verify_pressure_state_chain(&state_dir, None);
        assert_eq!(result["integrity_ok"], json!(false));
        assert!(result["issues"]
            .as_array()
            .unwrap()
            .iter()
            .any(|issue| issue.as_str().unwrap().contains("prev_state_hash mismatch")));
    }

    #[test]
    fn lock_contention_skips_write_and_event_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("pressure_state");
        std::fs::create_dir_all(&state_dir).unwrap();
        let held = FileLock::acquire_blocking(&state_dir.join(".lock")).unwrap();

        let state = PressureState::default();
        let write = save_pressure_state(&state, &state_dir).unwrap();
        drop(held);
        assert!(write.state_update_skipped);
        assert!(write.new_hash.is_none());

        let cfg = config();
        let run_context = RunContext {
            pipeline: "genesis".to_string(),
            capability: "vision".to_string(),
            router_attempt: 1,
        };
        let decision = decide_budget(&cfg, &state, &run_context);
        let event = build_governor_event(&decision, &run_context, &json!({"escalated": false}), &write);
        assert_eq!(event["governor"]["state_update_skipped"], json!(true));
        assert_eq!(event["governor"]["pressure_state_new_hash"], Value::Null);
    }

    #[test]
    fn event_cross_check_flags_unknown_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("pressure_state");
        let state = next_state(&PressureState::default(), "selected");
        save_pressure_state(&state, &state_dir).unwrap();

        let events = dir.path().join("amendment_log.jsonl");
        let row = json!({
            "timestamp": "2026-01-01T00:00:00Z",
            "proposal_id": "gov-1",
            "metadata": {
                "event_type": "proof_budget_governor",
                "governor": {
                    "state_update_skipped": false,
                    "pressure_state_new_hash": "deadbeef",
                },
            },
        });
        io::append_jsonl(&events, &row).unwrap();

        let result = verify_pressure_state_chain(&state_dir, Some(&events));
        assert!(result["issues"]
            .as_array()
            .unwrap()
            .iter()
            .any(|issue| issue.as_str().unwrap().contains("not found")));
    }
}
