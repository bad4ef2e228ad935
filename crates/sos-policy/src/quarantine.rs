//! Persistent quarantine kill switch.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use sos_chain::io;
use sos_config::{paths, Env};

use crate::events::record_forge_event;
use crate::incident::{write_incident, Incident};
use crate::posture::{resolve_posture, Sensitivity};
use crate::PolicyError;

/// On-disk quarantine state (`glow/forge/quarantine.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub activated_at: Option<String>,
    #[serde(default)]
    pub activated_by: Option<String>,
    #[serde(default)]
    pub last_incident_id: Option<String>,
    #[serde(default)]
    pub freeze_forge: bool,
    #[serde(default = "default_true")]
    pub allow_automerge: bool,
    #[serde(default = "default_true")]
    pub allow_publish: bool,
    #[serde(default = "default_true")]
    pub allow_federation_sync: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub acknowledged_at: Option<String>,
}

fn default_schema_version() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for QuarantineState {
    fn default() -> Self {
        Self {
            schema_version: 1,
            active: false,
            activated_at: None,
            activated_by: None,
            last_incident_id: None,
            freeze_forge: false,
            allow_automerge: true,
            allow_publish: true,
            allow_federation_sync: true,
            notes: Vec::new(),
            acknowledged_at: None,
        }
    }
}

/// Auto-activation policy, posture defaults overridden by environment.
#[derive(Debug, Clone)]
pub struct QuarantinePolicy {
    pub auto_activate: bool,
    pub freeze_forge: bool,
    pub block_automerge: bool,
    pub block_publish: bool,
    pub block_federation: bool,
}

impl QuarantinePolicy {
    pub fn load(env: &Env) -> Self {
        let posture = resolve_posture(env);
        let strict = posture.quarantine_auto_sensitivity == Sensitivity::Strict;
        Self {
            auto_activate: env
                .bool_override("SENTIENTOS_QUARANTINE_AUTO")
                .unwrap_or(strict),
            freeze_forge: env
                .bool_override("SENTIENTOS_QUARANTINE_FREEZE_FORGE")
                .unwrap_or(strict),
            block_automerge: env
                .bool_override("SENTIENTOS_QUARANTINE_BLOCK_AUTOMERGE")
                .unwrap_or(true),
            block_publish: env
                .bool_override("SENTIENTOS_QUARANTINE_BLOCK_PUBLISH")
                .unwrap_or(true),
            block_federation: env
                .bool_override("SENTIENTOS_QUARANTINE_BLOCK_FEDERATION")
                .unwrap_or(strict),
        }
    }
}

pub fn load_quarantine(root: &Path) -> QuarantineState {
    io::read_json(&root.join(paths::QUARANTINE_STATE))
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

pub fn save_quarantine(root: &Path, state: &QuarantineState) -> Result<(), PolicyError> {
    let value = sos_enc::canonical_value(state)?;
    io::write_json_atomic(&root.join(paths::QUARANTINE_STATE), &value)?;
    Ok(())
}

/// Activate when forced, or when the policy auto-activates, the incident's
/// enforcement mode matches the posture sensitivity, and failures exist.
/// The incident record is written either way.
pub fn maybe_activate_quarantine(
    root: &Path,
    env: &Env,
    failures: &[String],
    incident: &Incident,
    force_activate: bool,
) -> Result<(bool, QuarantineState), PolicyError> {
    let policy = QuarantinePolicy::load(env);
    let posture = resolve_posture(env);
    let mut state = load_quarantine(root);

    let mode_match = if posture.quarantine_auto_sensitivity == Sensitivity::Lenient {
        matches!(incident.enforcement_mode.as_str(), "enforce" | "warn")
    } else {
        incident.enforcement_mode == "enforce"
    };
    let should_activate =
        force_activate || (policy.auto_activate && mode_match && !failures.is_empty());

    let activated = if should_activate {
        let mut triggers: Vec<String> = failures.to_vec();
        triggers.sort();
        triggers.dedup();
        state.active = true;
        state.activated_at = Some(incident.created_at.clone());
        state.activated_by = Some("auto".to_string());
        state.last_incident_id = Some(incident.incident_id.clone());
        state.freeze_forge = policy.freeze_forge;
        state.allow_automerge = !policy.block_automerge;
        state.allow_publish = !policy.block_publish;
        state.allow_federation_sync = !policy.block_federation;
        state
            .notes
            .push(format!("auto:{}:{}", incident.incident_id, triggers.join(",")));
        warn!(incident = %incident.incident_id, ?triggers, "quarantine activated");
        record_forge_event(
            root,
            "integrity_quarantine_activated",
            "warning",
            json!({
                "incident_id": incident.incident_id,
                "triggers": triggers,
                "freeze_forge": state.freeze_forge,
            }),
        )?;
        true
    } else {
        false
    };

    write_incident(root, incident, activated)?;
    if !activated {
        record_forge_event(
            root,
            "integrity_incident_recorded",
            if incident.severity == "critical" { "error" } else { "warning" },
            json!({
                "incident_id": incident.incident_id,
                "triggers": incident.triggers,
                "enforcement_mode": incident.enforcement_mode,
            }),
        )?;
    }
    save_quarantine(root, &state)?;
    Ok((activated, state))
}

/// Append an acknowledgement note. Does not deactivate.
pub fn acknowledge_quarantine(root: &Path, note: &str) -> Result<QuarantineState, PolicyError> {
    let mut state = load_quarantine(root);
    let now = iso_now();
    state.notes.push(format!("ack:{now}:{note}"));
    state.acknowledged_at = Some(now);
    save_quarantine(root, &state)?;
    Ok(state)
}

/// Flip everything back to permissive.
pub fn clear_quarantine(root: &Path, note: &str) -> Result<QuarantineState, PolicyError> {
    let mut state = load_quarantine(root);
    state.active = false;
    state.freeze_forge = false;
    state.allow_automerge = true;
    state.allow_publish = true;
    state.allow_federation_sync = true;
    state.notes.push(format!("clear:{}:{note}", iso_now()));
    save_quarantine(root, &state)?;
    Ok(state)
}

fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
