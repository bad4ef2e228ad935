//! Test-provenance hash chain and reproducible bundles.
//!
//! Provenance snapshots are chained with the marker-prefix hash rule. A
//! bundle exports a verified window of snapshots plus their trend report into
//! a byte-reproducible `.tar.gz`; verification re-derives every hash from the
//! archive contents alone.

use std::path::{Path, PathBuf};

use serde_json::Value;

use sos_enc::{compute_chained_hash, EncError};

pub mod bundle;
pub mod trend;

pub use bundle::{export_bundle, read_bundle_runs, verify_bundle, BundleExport, WindowSelection};

/// Fields excluded from the provenance hash material.
pub const HASH_FIELDS: [&str; 3] = ["hash_algo", "prev_provenance_hash", "provenance_hash"];

/// Provenance-layer error.
#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad_json: {0}")]
    BadJson(String),
    #[error("no provenance snapshots selected for bundle window")]
    EmptyWindow,
    #[error("chain_discontinuity: {0}")]
    ChainDiscontinuity(String),
    #[error(transparent)]
    Enc(#[from] EncError),
    #[error(transparent)]
    Chain(#[from] sos_chain::ChainError),
}

/// One snapshot file and its parsed payload.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub path: PathBuf,
    pub file_name: String,
    pub payload: Value,
}

/// A contiguous, timestamp-ordered slice of snapshots.
#[derive(Debug, Clone)]
pub struct BundleWindow {
    pub snapshots: Vec<SnapshotRecord>,
    pub started_at: String,
    pub ended_at: String,
}

/// `(prev or GENESIS) || "\n" || canonical(payload without hash fields)`.
pub fn compute_provenance_hash(payload: &Value, prev: Option<&str>) -> Result<String, EncError> {
    compute_chained_hash(payload, prev, &HASH_FIELDS)
}

/// Load every parseable snapshot ordered by `(timestamp, file name)`.
pub fn load_snapshots(provenance_dir: &Path) -> Vec<SnapshotRecord> {
    let Ok(read_dir) = std::fs::read_dir(provenance_dir) else {
        return Vec::new();
    };
    let mut records: Vec<SnapshotRecord> = read_dir
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let file_name = entry.file_name().into_string().ok()?;
            if !file_name.ends_with(".json") {
                return None;
            }
            let path = entry.path();
            let payload = sos_chain::io::read_json(&path)?;
            Some(SnapshotRecord {
                path,
                file_name,
                payload,
            })
        })
        .collect();
    records.sort_by(|a, b| {
        let key = |record: &SnapshotRecord| {
            (
                record
                    .payload
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                record.file_name.clone(),
            )
        };
        key(a).cmp(&key(b))
    });
    records
}

/// Select the export window: the newest `last`, or an inclusive
/// `[from, to]` timestamp range.
pub fn select_window(
    records: Vec<SnapshotRecord>,
    selection: &WindowSelection,
) -> Result<BundleWindow, ProvenanceError> {
    let selected: Vec<SnapshotRecord> = match selection {
        WindowSelection::Last(n) => {
            let skip = records.len().saturating_sub(*n);
            records.into_iter().skip(skip).collect()
        }
        WindowSelection::Range { from, to } => records
            .into_iter()
            .filter(|record| {
                let ts = record
                    .payload
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                ts >= from.as_str() && ts <= to.as_str()
            })
            .collect(),
    };
    if selected.is_empty() {
        return Err(ProvenanceError::EmptyWindow);
    }
    let window_ts = |record: &SnapshotRecord| {
        record
            .payload
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or(&record.file_name)
            .to_string()
    };
    let started_at = window_ts(&selected[0]);
    let ended_at = window_ts(selected.last().expect("non-empty"));
    Ok(BundleWindow {
        snapshots: selected,
        started_at,
        ended_at,
    })
}

/// Verify the window is an unbroken hash chain. Returns the first snapshot's
/// prev hash (the anchor into history before the window).
pub fn verify_window_chain(window: &BundleWindow) -> (bool, Vec<String>, Option<String>) {
    let mut issues: Vec<String> = Vec::new();
    let mut prior_hash: Option<String> = None;
    let mut anchor_prev: Option<String> = None;

    for (index, record) in window.snapshots.iter().enumerate() {
        let name = &record.file_name;
        let payload = &record.payload;
        let prev = payload.get("prev_provenance_hash").and_then(Value::as_str);
        let actual = payload.get("provenance_hash").and_then(Value::as_str);

        if payload.get("hash_algo").and_then(Value::as_str) != Some(sos_enc::HASH_ALGO) {
            issues.push(format!("{name}: bad_hash_algo"));
        }
        if prev.is_none() {
            issues.push(format!("{name}: missing prev_provenance_hash"));
        }
        let Some(actual) = actual else {
            issues.push(format!("{name}: missing provenance_hash"));
            continue;
        };

        if index == 0 {
            anchor_prev = prev.map(str::to_string);
        } else if prev != prior_hash.as_deref() {
            issues.push(format!("{name}: chain_discontinuity"));
        }

        let chain_prev = prev.filter(|p| *p != sos_enc::GENESIS_MARKER);
        match compute_provenance_hash(payload, chain_prev) {
            Ok(expected) if expected == actual => {}
            Ok(_) => issues.push(format!("{name}: payload_hash_mismatch")),
            Err(err) => issues.push(format!("{name}: {err}")),
        }
        prior_hash = Some(actual.to_string());
    }

    (issues.is_empty(), issues, anchor_prev)
}

/// Writer-side helper: append a snapshot to the provenance chain on disk.
pub fn append_snapshot(
    provenance_dir: &Path,
    file_name: &str,
    mut payload: Value,
) -> Result<Value, ProvenanceError> {
    let records = load_snapshots(provenance_dir);
    let prev = records
        .last()
        .and_then(|record| record.payload.get("provenance_hash").and_then(Value::as_str))
        .map(str::to_string);
    {
        let object = payload
            .as_object_mut()
            .ok_or_else(|| ProvenanceError::BadJson("snapshot payload must be an object".into()))?;
        object.insert(
            "prev_provenance_hash".to_string(),
            Value::String(
                prev.clone()
                    .unwrap_or_else(|| sos_enc::GENESIS_MARKER.to_string()),
            ),
        );
        object.insert("hash_algo".to_string(), Value::String(sos_enc::HASH_ALGO.to_string()));
    }
    let hash = compute_provenance_hash(&payload, prev.as_deref())?;
    payload
        .as_object_mut()
        .expect("checked above")
        .insert("provenance_hash".to_string(), Value::String(hash));
    sos_chain::io::write_json_atomic(&provenance_dir.join(file_name), &payload)?;
    Ok(payload)
}
