//! Throughput policy: map pressure and quarantine onto permission toggles.

use serde_json::{json, Value};

use sos_config::Env;

use crate::posture::resolve_posture;
use crate::quarantine::QuarantineState;

/// Derived throughput class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Normal,
    Cautious,
    Recovery,
    Lockdown,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Normal => "normal",
            OperatingMode::Cautious => "cautious",
            OperatingMode::Recovery => "recovery",
            OperatingMode::Lockdown => "lockdown",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(OperatingMode::Normal),
            "cautious" => Some(OperatingMode::Cautious),
            "recovery" => Some(OperatingMode::Recovery),
            "lockdown" => Some(OperatingMode::Lockdown),
            _ => None,
        }
    }
}

/// Permission toggles for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughputPolicy {
    pub mode: OperatingMode,
    pub allow_automerge: bool,
    pub allow_publish: bool,
    pub allow_forge_mutation: bool,
    pub allow_federation_adopt: bool,
    pub run_integrity_sweeps: bool,
    pub prefer_diagnostics_only: bool,
    pub max_forge_scope: i64,
}

impl ThroughputPolicy {
    pub fn to_value(&self) -> Value {
        json!({
            "mode": self.mode.as_str(),
            "allow_automerge": self.allow_automerge,
            "allow_publish": self.allow_publish,
            "allow_forge_mutation": self.allow_forge_mutation,
            "allow_federation_adopt": self.allow_federation_adopt,
            "run_integrity_sweeps": self.run_integrity_sweeps,
            "prefer_diagnostics_only": self.prefer_diagnostics_only,
            "max_forge_scope": self.max_forge_scope,
        })
    }
}

/// Pure derivation of the throughput policy.
///
/// Mode precedence: `SENTIENTOS_MODE_FORCE`, then active quarantine with a
/// forge freeze, then posture-scaled pressure thresholds. The automerge and
/// publish env overrides are the operator escape hatch and bypass the mode
/// defaults on purpose.
pub fn derive_throughput_policy(
    env: &Env,
    pressure_level: i64,
    quarantine: Option<&QuarantineState>,
) -> ThroughputPolicy {
    let posture = resolve_posture(env);
    let forced = env
        .mode(
            "SENTIENTOS_MODE_FORCE",
            &["normal", "cautious", "recovery", "lockdown"],
        )
        .and_then(|name| OperatingMode::from_name(&name));

    let mode = if let Some(mode) = forced {
        mode
    } else if quarantine.map(|q| q.active && q.freeze_forge).unwrap_or(false) {
        OperatingMode::Lockdown
    } else if pressure_level >= posture.throughput_lockdown_level {
        OperatingMode::Lockdown
    } else if pressure_level >= posture.throughput_recovery_level {
        OperatingMode::Recovery
    } else if pressure_level >= posture.throughput_cautious_level {
        OperatingMode::Cautious
    } else {
        OperatingMode::Normal
    };

    let mut policy = defaults_for_mode(env, mode);
    if let Some(automerge) = env.bool_override("SENTIENTOS_MODE_ALLOW_AUTOMERGE") {
        policy.allow_automerge = automerge;
    }
    if let Some(publish) = env.bool_override("SENTIENTOS_MODE_ALLOW_PUBLISH") {
        policy.allow_publish = publish;
    }
    policy
}

fn defaults_for_mode(env: &Env, mode: OperatingMode) -> ThroughputPolicy {
    let posture = resolve_posture(env);
    match mode {
        OperatingMode::Normal => ThroughputPolicy {
            mode,
            allow_automerge: posture.default_automerge_enabled,
            allow_publish: true,
            allow_forge_mutation: true,
            allow_federation_adopt: true,
            run_integrity_sweeps: false,
            prefer_diagnostics_only: false,
            max_forge_scope: 200,
        },
        OperatingMode::Cautious => ThroughputPolicy {
            mode,
            allow_automerge: false,
            allow_publish: false,
            allow_forge_mutation: true,
            allow_federation_adopt: true,
            run_integrity_sweeps: true,
            prefer_diagnostics_only: false,
            max_forge_scope: 80,
        },
        OperatingMode::Recovery => ThroughputPolicy {
            mode,
            allow_automerge: false,
            allow_publish: false,
            allow_forge_mutation: false,
            allow_federation_adopt: false,
            run_integrity_sweeps: true,
            prefer_diagnostics_only: true,
            max_forge_scope: 25,
        },
        OperatingMode::Lockdown => ThroughputPolicy {
            mode,
            allow_automerge: false,
            allow_publish: false,
            allow_forge_mutation: false,
            allow_federation_adopt: false,
            run_integrity_sweeps: true,
            prefer_diagnostics_only: true,
            max_forge_scope: 0,
        },
    }
}
