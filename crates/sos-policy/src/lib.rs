//! Posture, pressure, quarantine, throughput, and risk policy.
//!
//! The decision stack consumed by the integrity controller: a strategic
//! posture scales incident thresholds, recent incidents produce a pressure
//! level, quarantine is the persistent kill switch, and the throughput policy
//! plus risk budget translate all of it into concrete permission toggles and
//! per-tick caps.

pub mod events;
pub mod incident;
pub mod posture;
pub mod pressure;
pub mod quarantine;
pub mod risk;
pub mod throughput;

pub use incident::{write_incident, Incident};
pub use posture::{resolve_posture, derived_thresholds, PostureName, StrategicPosture};
pub use pressure::{
    apply_escalation, compute_integrity_pressure, should_force_quarantine, update_pressure_level,
    PressureMetrics, PressureSnapshot,
};
pub use quarantine::{
    acknowledge_quarantine, clear_quarantine, load_quarantine, maybe_activate_quarantine,
    QuarantinePolicy, QuarantineState,
};
pub use risk::{compute_risk_budget, RiskBudget};
pub use throughput::{derive_throughput_policy, OperatingMode, ThroughputPolicy};

/// Policy-layer error.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Chain(#[from] sos_chain::ChainError),
    #[error(transparent)]
    Enc(#[from] sos_enc::EncError),
}
