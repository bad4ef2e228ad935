//! Forge integrity substrate: controller, orchestrator, attestation, replay.
//!
//! The library half of the `forge` binary. Everything operates on a
//! [`CoreContext`] holding the repository root and the environment snapshot
//! captured at operation start, so a single tick never observes a mid-flight
//! configuration change.

use std::path::{Path, PathBuf};

use chrono::Utc;

use sos_config::Env;

pub mod anchors;
pub mod audit_gate;
pub mod controller;
pub mod doctrine;
pub mod governor;
pub mod observatory;
pub mod orchestrator;
pub mod policy_fingerprint;
pub mod receipts;
pub mod replay;
pub mod rollups;
pub mod snapshot;
pub mod status;
pub mod strategic;
pub mod witness;

/// Top-level error for forge operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Chain(#[from] sos_chain::ChainError),
    #[error(transparent)]
    Envelope(#[from] sos_envelope::EnvelopeError),
    #[error(transparent)]
    Policy(#[from] sos_policy::PolicyError),
    #[error(transparent)]
    Enc(#[from] sos_enc::EncError),
    #[error(transparent)]
    Provenance(#[from] sos_provenance::ProvenanceError),
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Repository root plus the environment snapshot for one operation.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub root: PathBuf,
    pub env: Env,
}

impl CoreContext {
    /// Capture the live environment against a repository root.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            env: Env::capture(),
        }
    }

    /// Explicit environment snapshot. Test seam and replay entry point.
    pub fn with_env(root: &Path, env: Env) -> Self {
        Self {
            root: root.to_path_buf(),
            env,
        }
    }
}

/// ISO-8601 UTC with trailing `Z`, second resolution.
pub fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Timestamp rendered safe for file names.
pub fn safe_ts(ts: &str) -> String {
    ts.replace([':', '.'], "-")
}
