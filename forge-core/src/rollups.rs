//! Weekly rollup signature streams.
//!
//! Rollups live under `glow/forge/rollups/<stream>/rollup_<week>.json`; each
//! sub-stream carries its own envelope chain under `<stream>/signatures/`.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use sos_chain::io;
use sos_config::{paths, Env};
use sos_envelope::{
    latest_sig_hash, maybe_sign, verify_stream, ObjectRef, Stream, StreamPaths, VerifyResult,
};

use crate::CoreError;

fn substream_paths(stream_name: &str) -> StreamPaths {
    StreamPaths::new(
        PathBuf::from(paths::ROLLUPS_DIR)
            .join(stream_name)
            .join("signatures"),
    )
}

fn substream_names(root: &Path) -> Vec<String> {
    let Ok(read_dir) = std::fs::read_dir(root.join(paths::ROLLUPS_DIR)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read_dir
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Sign every rollup file that has no envelope yet, in stable order.
pub fn sign_existing_unsigned_rollups(root: &Path, env: &Env) -> Result<Vec<Value>, CoreError> {
    let mut signed = Vec::new();
    for stream_name in substream_names(root) {
        let stream_dir = root.join(paths::ROLLUPS_DIR).join(&stream_name);
        let stream_paths = substream_paths(&stream_name);
        let already_signed: std::collections::BTreeSet<String> =
            io::read_jsonl(&root.join(&stream_paths.index_path))
                .iter()
                .filter_map(|row| row.get("path").and_then(Value::as_str))
                .map(str::to_string)
                .collect();

        let Ok(read_dir) = std::fs::read_dir(&stream_dir) else {
            continue;
        };
        let mut rollup_names: Vec<String> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("rollup_") && name.ends_with(".json"))
            .collect();
        rollup_names.sort();

        for name in rollup_names {
            let rel = format!("{}/{}/{}", paths::ROLLUPS_DIR, stream_name, name);
            if already_signed.contains(&rel) {
                continue;
            }
            let Some(payload) = io::read_json(&root.join(&rel)) else {
                continue;
            };
            let object_id = name
                .trim_start_matches("rollup_")
                .trim_end_matches(".json")
                .to_string();
            let created_at = payload
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or(&object_id)
                .to_string();
            if let Some(envelope) = maybe_sign(
                root,
                env,
                Stream::Rollup,
                &stream_paths,
                &ObjectRef {
                    object_id: &object_id,
                    created_at: &created_at,
                    rel_path: &rel,
                    payload: &payload,
                },
            )? {
                info!(stream = %stream_name, rollup = %rel, "rollup signed");
                signed.push(envelope);
            }
        }
    }
    Ok(signed)
}

/// Verify every sub-stream's newest `last_n` envelopes; first failure wins.
pub fn verify_signed_rollups(
    root: &Path,
    env: &Env,
    last_n: usize,
) -> Result<VerifyResult, CoreError> {
    let enforce = env.flag("SENTIENTOS_ROLLUP_SIG_ENFORCE");
    let mut aggregate: Option<VerifyResult> = None;
    for stream_name in substream_names(root) {
        let result = verify_stream(
            root,
            env,
            Stream::Rollup,
            &substream_paths(&stream_name),
            last_n,
            enforce,
        )?;
        if !result.ok {
            return Ok(result);
        }
        match &mut aggregate {
            Some(total) => total.checked_n += result.checked_n,
            None => aggregate = Some(result),
        }
    }
    Ok(aggregate.unwrap_or(VerifyResult {
        ok: true,
        status: "skipped".to_string(),
        reason: Some("signature_missing".to_string()),
        checked_n: 0,
        last_ok_hash: None,
    }))
}

/// Tip hash across rollup signature streams (newest stream tip wins).
pub fn latest_rollup_sig_hash(root: &Path) -> Option<String> {
    substream_names(root)
        .iter()
        .rev()
        .find_map(|name| latest_sig_hash(&root.join(&substream_paths(name).index_path)))
}

/// Tip of the signed catalog-checkpoint stream.
pub fn latest_catalog_checkpoint_hash(root: &Path) -> Option<String> {
    let stream_paths = StreamPaths::new(PathBuf::from(
        "glow/forge/attestation/signatures/catalog_checkpoints",
    ));
    latest_sig_hash(&root.join(&stream_paths.index_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sos_envelope::reset_key_cache;

    fn rollup_env() -> Env {
        Env::from_pairs([
            ("SENTIENTOS_ROLLUP_SIGNING", "hmac-test"),
            ("SENTIENTOS_ROLLUP_HMAC_SECRET", "rollup-secret"),
        ])
    }

    fn seed_rollup(root: &Path, stream: &str, week: &str) {
        let rel = format!("{}/{stream}/rollup_{week}.json", paths::ROLLUPS_DIR);
        io::write_json_atomic(
            &root.join(rel),
            &json!({"week": week, "created_at": format!("{week}T00:00:00Z"), "merges": 3}),
        )
        .unwrap();
    }

    #[test]
    fn unsigned_rollups_get_signed_once() {
        reset_key_cache();
        let dir = tempfile::tempdir().unwrap();
        let env = rollup_env();
        seed_rollup(dir.path(), "merges", "2026-W01");
        seed_rollup(dir.path(), "merges", "2026-W02");

        let signed = sign_existing_unsigned_rollups(dir.path(), &env).unwrap();
        assert_eq!(signed.len(), 2);
        assert_eq!(signed[1]["prev_sig_hash"], signed[0]["sig_hash"]);

        let again = sign_existing_unsigned_rollups(dir.path(), &env).unwrap();
        assert!(again.is_empty());

        let result = verify_signed_rollups(dir.path(), &env, 6).unwrap();
        assert!(result.ok);
        assert_eq!(result.checked_n, 2);
        assert!(latest_rollup_sig_hash(dir.path()).is_some());
        reset_key_cache();
    }

    #[test]
    fn tampered_rollup_fails_verification() {
        reset_key_cache();
        let dir = tempfile::tempdir().unwrap();
        let env = rollup_env();
        seed_rollup(dir.path(), "merges", "2026-W01");
        sign_existing_unsigned_rollups(dir.path(), &env).unwrap();

        let rel = format!("{}/merges/rollup_2026-W01.json", paths::ROLLUPS_DIR);
        let mut payload = io::read_json(&dir.path().join(&rel)).unwrap();
        payload["merges"] = json!(99);
        io::write_json_atomic(&dir.path().join(&rel), &payload).unwrap();

        let result = verify_signed_rollups(dir.path(), &env, 6).unwrap();
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("object_sha_mismatch"));
        reset_key_cache();
    }
}
