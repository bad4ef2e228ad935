//! Replay must never publish: no snapshot without the explicit flag, no
//! catalog rebuild without the explicit override, report always written.

use serde_json::json;

use forge_core::orchestrator::tick;
use forge_core::replay::{replay, ReplayArgs};
use forge_core::CoreContext;
use sos_chain::io;
use sos_config::{paths, Env};
use sos_envelope::reset_key_cache;

fn snapshot_count(root: &std::path::Path) -> usize {
    std::fs::read_dir(root.join(paths::SNAPSHOT_DIR))
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

#[test]
fn replay_writes_report_without_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::with_env(dir.path(), Env::default());

    let payload = replay(
        &ctx,
        &ReplayArgs {
            verify: true,
            last_n: 25,
            emit_snapshot: false,
            write_policy: false,
        },
    )
    .unwrap();

    assert_eq!(snapshot_count(dir.path()), 0);
    assert_eq!(payload["snapshot_emission"]["emitted"], json!(false));
    assert_eq!(payload["snapshot_emission"]["reason"], json!("flag_disabled"));
    assert_eq!(payload["catalog"]["reason"], json!("skipped_catalog_rebuild"));
    assert_eq!(payload["writes"]["policy_path"], serde_json::Value::Null);

    // The replay report itself is the only artifact.
    let replay_dir = dir.path().join(paths::REPLAY_DIR);
    assert_eq!(std::fs::read_dir(&replay_dir).unwrap().count(), 1);
    let pulse = io::read_jsonl(&dir.path().join(paths::REPLAY_PULSE));
    assert_eq!(pulse.len(), 1);
}

#[test]
fn replay_reports_disabled_streams() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::with_env(dir.path(), Env::default());
    let payload = replay(&ctx, &ReplayArgs::default()).unwrap();
    for stream in [
        "attestation_snapshot_signatures",
        "rollup_signatures",
        "strategic_signatures",
    ] {
        assert_eq!(
            payload["verification"][stream]["reason"],
            json!("verify_disabled")
        );
    }
}

#[test]
fn replay_budget_marks_excess_streams_exhausted() {
    reset_key_cache();
    let dir = tempfile::tempdir().unwrap();
    let env = Env::from_pairs([
        ("SENTIENTOS_ATTESTATION_SNAPSHOT_VERIFY", "1"),
        ("SENTIENTOS_ROLLUP_SIG_VERIFY", "1"),
        ("SENTIENTOS_STRATEGIC_SIG_VERIFY", "1"),
        ("SENTIENTOS_INTEGRITY_MAX_VERIFY_STREAMS", "1"),
    ]);
    let ctx = CoreContext::with_env(dir.path(), env);
    let payload = replay(&ctx, &ReplayArgs::default()).unwrap();

    assert_ne!(
        payload["verification"]["attestation_snapshot_signatures"]["reason"],
        json!("skipped_budget_exhausted")
    );
    assert_eq!(
        payload["verification"]["rollup_signatures"]["reason"],
        json!("skipped_budget_exhausted")
    );
    assert_eq!(
        payload["verification"]["strategic_signatures"]["reason"],
        json!("skipped_budget_exhausted")
    );
    reset_key_cache();
}

#[test]
fn replay_reproduces_the_live_integrity_hash() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::with_env(dir.path(), Env::default());
    let report = tick(&ctx).unwrap();

    let payload = replay(&ctx, &ReplayArgs::default()).unwrap();
    // Same on-disk state and environment: the replayed evaluation carries the
    // same policy hash and the same verdicts as the live tick.
    assert_eq!(payload["integrity"]["policy_hash"], json!(report.policy_hash));
    assert_eq!(payload["integrity"]["status"], json!("ok"));
    assert_eq!(
        payload["integrity"]["mutation_allowed"],
        report.integrity_status["mutation_allowed"]
    );

    // Replay after a tick does not add snapshots.
    assert_eq!(snapshot_count(dir.path()), 1);
}

#[test]
fn replay_emit_flag_allows_a_single_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::with_env(dir.path(), Env::default());
    let payload = replay(
        &ctx,
        &ReplayArgs {
            verify: false,
            last_n: 25,
            emit_snapshot: true,
            write_policy: true,
        },
    )
    .unwrap();
    assert_eq!(payload["snapshot_emission"]["emitted"], json!(true));
    assert_eq!(payload["snapshot_emission"]["reason"], json!("emitted"));
    assert_eq!(snapshot_count(dir.path()), 1);
    assert!(payload["writes"]["policy_path"].is_string());

    let witness = io::read_json(
        &dir.path().join(paths::SNAPSHOT_DIR).join(
            payload["snapshot_emission"]["path"]
                .as_str()
                .unwrap()
                .rsplit('/')
                .next()
                .unwrap(),
        ),
    )
    .unwrap();
    assert_eq!(witness["witness_summary"], json!({"replay_mode": true}));
}

#[test]
fn catalog_rebuild_requires_explicit_override() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::from_pairs([("SENTIENTOS_ALLOW_CATALOG_REBUILD", "1")]);
    let ctx = CoreContext::with_env(dir.path(), env);
    let payload = replay(&ctx, &ReplayArgs::default()).unwrap();
    assert_eq!(payload["catalog"]["status"], json!("rebuilt"));
    assert!(dir.path().join(paths::CATALOG).exists());

    // Present catalogs are left untouched on the next replay.
    let payload = replay(&ctx, &ReplayArgs::default()).unwrap();
    assert_eq!(payload["catalog"]["status"], json!("present"));
}
