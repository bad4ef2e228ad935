//! Repository-relative locations of primary and derived artifacts.

/// Merge receipts and their derived index.
pub const RECEIPTS_DIR: &str = "glow/forge/receipts";
pub const RECEIPTS_INDEX: &str = "glow/forge/receipts/receipts_index.jsonl";

/// Signed anchors over the receipt chain.
pub const ANCHORS_DIR: &str = "glow/forge/receipts/anchors";
pub const ANCHORS_INDEX: &str = "glow/forge/receipts/anchors/anchors_index.jsonl";

/// Attestation snapshots and their signature stream.
pub const SNAPSHOT_DIR: &str = "glow/forge/attestation/snapshots";
pub const SNAPSHOT_SIG_DIR: &str = "glow/forge/attestation/signatures/attestation_snapshots";
pub const SNAPSHOT_SIG_INDEX: &str =
    "glow/forge/attestation/signatures/attestation_snapshots/signatures_index.jsonl";
pub const SNAPSHOT_PULSE: &str = "pulse/attestation_snapshots.jsonl";

/// Weekly rollups, one sub-stream per directory.
pub const ROLLUPS_DIR: &str = "glow/forge/rollups";

/// Integrity status, policy fingerprints, quarantine, pressure level.
pub const INTEGRITY_DIR: &str = "glow/forge/integrity";
pub const POLICY_DIR: &str = "glow/forge/policy";
pub const POLICY_PULSE: &str = "pulse/policy.jsonl";
pub const QUARANTINE_STATE: &str = "glow/forge/quarantine.json";
pub const PRESSURE_LEVEL_STATE: &str = "glow/forge/integrity_pressure_state.json";
pub const INCIDENTS_DIR: &str = "glow/forge/incidents";
pub const INCIDENT_FEED: &str = "pulse/integrity_incidents.jsonl";
pub const FORGE_EVENTS: &str = "pulse/forge_events.jsonl";

/// Governor pressure-state chain.
pub const GOVERNOR_STATE_DIR: &str = "glow/routing/pressure_state";
pub const AMENDMENT_LOG: &str = "integration/amendment_log.jsonl";

/// Test provenance snapshots and bundles.
pub const PROVENANCE_DIR: &str = "glow/test_runs/provenance";
pub const BUNDLES_DIR: &str = "glow/test_runs/bundles";
pub const ARCHIVE_INDEX: &str = "glow/test_runs/archive_index.jsonl";
pub const TREND_REPORT: &str = "glow/test_runs/test_trend_report.json";

/// Audit logs, reports, and the doctor's output.
pub const AUDIT_LOGS_DIR: &str = "logs";
pub const AUDIT_REPORTS_DIR: &str = "glow/forge/audit_reports";

/// Replay reports.
pub const REPLAY_DIR: &str = "glow/forge/replay";
pub const REPLAY_PULSE: &str = "pulse/replay_runs.jsonl";

/// Federation identity, peers, witness artifacts.
pub const FEDERATION_BASELINE: &str = "glow/federation/baseline/federation_identity_baseline.json";
pub const FEDERATION_PEERS_DIR: &str = "glow/federation/peers";
pub const WITNESS_TAGS: &str = "glow/federation/anchor_witness_tags.jsonl";
pub const WITNESS_STATUS: &str = "glow/federation/anchor_witness_status.json";

/// Doctrine identity baseline input.
pub const VOW_MANIFEST: &str = "vow/immutable_manifest.json";

/// Operator-visible observatory summary.
pub const OBSERVATORY_INDEX: &str = "glow/forge/forge_observatory.json";

/// Append-only job queue consumed against the receipts feed.
pub const QUEUE: &str = "pulse/queue.jsonl";
pub const RECEIPTS_PULSE: &str = "pulse/receipts.jsonl";

/// Ratchet status probe.
pub const MYPY_RATCHET_STATUS: &str = "glow/forge/ratchets/mypy_ratchet_status.json";

/// Derived artifact catalog marker consulted by replay.
pub const CATALOG: &str = "glow/forge/artifact_catalog.jsonl";
