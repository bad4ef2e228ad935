//! Reproducible provenance bundles.
//!
//! The tar is written with fixed entry metadata (uid=gid=0, mtime=0, empty
//! owner names, sorted entries) and gzip with mtime 0, so identical inputs
//! produce identical bytes. The manifest carries no wall-clock fields for the
//! same reason; timestamps live only in the archive-index row.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tracing::info;

use sos_chain::io;
use sos_enc::{canonical_bytes, sha256_hex};

use crate::trend::analyze_window;
use crate::{
    compute_provenance_hash, load_snapshots, select_window, verify_window_chain, BundleWindow,
    ProvenanceError,
};

const TREND_REPORT_NAME: &str = "test_trend_report.json";

/// How the export window is chosen.
#[derive(Debug, Clone)]
pub enum WindowSelection {
    Last(usize),
    Range { from: String, to: String },
}

/// A finished export.
#[derive(Debug, Clone)]
pub struct BundleExport {
    pub bundle_path: PathBuf,
    pub manifest: Value,
    pub index_entry: Value,
    pub snapshot_count: usize,
}

/// Export a verified window into a deterministic `.tar.gz`.
pub fn export_bundle(
    provenance_dir: &Path,
    out: &Path,
    selection: &WindowSelection,
    trend_report_path: Option<&Path>,
    archive_index_path: &Path,
) -> Result<BundleExport, ProvenanceError> {
    let window = select_window(load_snapshots(provenance_dir), selection)?;
    let (chain_ok, issues, anchor_prev) = verify_window_chain(&window);
    if !chain_ok {
        return Err(ProvenanceError::ChainDiscontinuity(issues.join("; ")));
    }

    let trend_report = match trend_report_path.filter(|path| path.exists()) {
        Some(path) => io::read_json(path)
            .ok_or_else(|| ProvenanceError::BadJson("trend report is not a JSON object".into()))?,
        None => analyze_window(&window),
    };

    let manifest = build_manifest(&window, anchor_prev.as_deref());
    let bundle_path = resolve_out_path(out, &window);
    let archive = build_archive(&window, &manifest, &trend_report)?;
    if let Some(parent) = bundle_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&bundle_path, &archive)?;

    let manifest_hash = sha256_hex(&canonical_bytes(&manifest)?);
    let index_entry = json!({
        "schema_version": 1,
        "created_at": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "bundle_path": bundle_path.to_string_lossy(),
        "manifest_hash": manifest_hash,
        "first_provenance_hash": manifest["first_provenance_hash"],
        "last_provenance_hash": manifest["last_provenance_hash"],
        "count": window.snapshots.len(),
        "window_from": window.started_at,
        "window_to": window.ended_at,
    });
    io::append_jsonl(archive_index_path, &index_entry)?;
    info!(bundle = %bundle_path.display(), snapshots = window.snapshots.len(), "exported provenance bundle");

    Ok(BundleExport {
        bundle_path,
        manifest,
        index_entry,
        snapshot_count: window.snapshots.len(),
    })
}

fn build_manifest(window: &BundleWindow, anchor_prev: Option<&str>) -> Value {
    let files: Vec<Value> = window
        .snapshots
        .iter()
        .map(|record| {
            json!({
                "name": format!("provenance/{}", record.file_name),
                "provenance_hash": record
                    .payload
                    .get("provenance_hash")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            })
        })
        .collect();

    let mut manifest = json!({
        "schema_version": 1,
        "bundle_window": {
            "from": window.started_at,
            "to": window.ended_at,
            "count": window.snapshots.len(),
        },
        "hash_algo": sos_enc::HASH_ALGO,
        "first_provenance_hash": window.snapshots[0]
            .payload
            .get("provenance_hash")
            .and_then(Value::as_str)
            .unwrap_or(""),
        "last_provenance_hash": window
            .snapshots
            .last()
            .expect("window is non-empty")
            .payload
            .get("provenance_hash")
            .and_then(Value::as_str)
            .unwrap_or(""),
        "files": files,
        "trend_report": TREND_REPORT_NAME,
    });
    if let Some(anchor) = anchor_prev {
        manifest["anchor_prev_provenance_hash"] = json!(anchor);
    }
    manifest
}

fn resolve_out_path(out: &Path, window: &BundleWindow) -> PathBuf {
    let name = out.to_string_lossy();
    if name.ends_with(".tar.gz") {
        return out.to_path_buf();
    }
    let sanitize = |ts: &str| ts.replace([':', '.'], "-");
    out.join(format!(
        "provenance_bundle_{}_{}.tar.gz",
        sanitize(&window.started_at),
        sanitize(&window.ended_at)
    ))
}

fn build_archive(
    window: &BundleWindow,
    manifest: &Value,
    trend_report: &Value,
) -> Result<Vec<u8>, ProvenanceError> {
    // BTreeMap fixes entry order regardless of insertion order.
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    entries.insert("manifest.json".to_string(), pretty_bytes(manifest)?);
    for record in &window.snapshots {
        entries.insert(
            format!("provenance/{}", record.file_name),
            pretty_bytes(&record.payload)?,
        );
    }
    entries.insert(TREND_REPORT_NAME.to_string(), pretty_bytes(trend_report)?);

    let mut tar_bytes: Vec<u8> = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for (name, body) in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_slice())
                .map_err(ProvenanceError::Io)?;
        }
        builder.finish().map_err(ProvenanceError::Io)?;
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes)?;
    encoder.finish().map_err(ProvenanceError::Io)
}

fn pretty_bytes(value: &Value) -> Result<Vec<u8>, ProvenanceError> {
    let mut body = serde_json::to_vec_pretty(value)
        .map_err(|err| ProvenanceError::BadJson(err.to_string()))?;
    body.push(b'\n');
    Ok(body)
}

/// Read every entry of a bundle into memory.
fn read_archive_entries(bundle_path: &Path) -> Result<BTreeMap<String, Vec<u8>>, ProvenanceError> {
    let file = std::fs::File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        entries.insert(name, body);
    }
    Ok(entries)
}

/// Verify a bundle end to end. Mirrors the export checks: manifest schema,
/// per-file payload hashes, chain linkage, manifest tip hashes, trend report
/// presence.
pub fn verify_bundle(bundle_path: &Path) -> Value {
    let mut summary = json!({
        "bundle": bundle_path.to_string_lossy(),
        "schema_ok": false,
        "hashes_ok": false,
        "chain_ok": false,
        "verified": false,
        "errors": [],
    });
    let mut errors: Vec<String> = Vec::new();

    let entries = match read_archive_entries(bundle_path) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push(err.to_string());
            summary["errors"] = json!(errors);
            return summary;
        }
    };

    let Some(manifest) = entries
        .get("manifest.json")
        .and_then(|body| serde_json::from_slice::<Value>(body).ok())
    else {
        errors.push("manifest.json missing".to_string());
        summary["errors"] = json!(errors);
        return summary;
    };

    let schema_errors = validate_manifest_schema(&manifest);
    let schema_ok = schema_errors.is_empty();
    errors.extend(schema_errors);
    summary["schema_ok"] = json!(schema_ok);

    if schema_ok {
        let files = manifest["files"].as_array().cloned().unwrap_or_default();
        let (chain_ok, chain_errors, first_hash, last_hash) = verify_entry_chain(&files, &entries);
        errors.extend(chain_errors);
        summary["chain_ok"] = json!(chain_ok);
        let mut hashes_ok = chain_ok;

        if first_hash.as_deref() != manifest["first_provenance_hash"].as_str() {
            errors.push("manifest first_provenance_hash mismatch".to_string());
            hashes_ok = false;
        }
        if last_hash.as_deref() != manifest["last_provenance_hash"].as_str() {
            errors.push("manifest last_provenance_hash mismatch".to_string());
            hashes_ok = false;
        }
        summary["hashes_ok"] = json!(hashes_ok);
        summary["first_provenance_hash"] = json!(first_hash);
        summary["last_provenance_hash"] = json!(last_hash);

        let trend_name = manifest["trend_report"].as_str().unwrap_or(TREND_REPORT_NAME);
        if !entries.contains_key(trend_name) {
            errors.push("trend report missing".to_string());
        }

        let verified = schema_ok && hashes_ok && chain_ok;
        summary["verified"] = json!(verified);
    }

    summary["errors"] = json!(errors);
    summary
}

/// Verify a bundle without touching disk and return the run payloads in
/// manifest order.
pub fn read_bundle_runs(bundle_path: &Path) -> Result<Vec<Value>, ProvenanceError> {
    let summary = verify_bundle(bundle_path);
    if summary["verified"] != json!(true) {
        let errors = summary["errors"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        return Err(ProvenanceError::ChainDiscontinuity(errors));
    }

    let entries = read_archive_entries(bundle_path)?;
    let manifest: Value = serde_json::from_slice(entries.get("manifest.json").expect("verified"))
        .map_err(|err| ProvenanceError::BadJson(err.to_string()))?;
    let mut runs = Vec::new();
    for file in manifest["files"].as_array().cloned().unwrap_or_default() {
        let name = file["name"].as_str().unwrap_or_default();
        let body = entries
            .get(name)
            .ok_or_else(|| ProvenanceError::BadJson(format!("missing payload file: {name}")))?;
        runs.push(
            serde_json::from_slice(body)
                .map_err(|err| ProvenanceError::BadJson(err.to_string()))?,
        );
    }
    Ok(runs)
}

fn validate_manifest_schema(manifest: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let checks: [(&str, fn(&Value) -> bool); 7] = [
        ("schema_version", Value::is_u64),
        ("bundle_window", Value::is_object),
        ("hash_algo", Value::is_string),
        ("first_provenance_hash", Value::is_string),
        ("last_provenance_hash", Value::is_string),
        ("files", Value::is_array),
        ("trend_report", Value::is_string),
    ];
    for (key, check) in checks {
        if !manifest.get(key).map(check).unwrap_or(false) {
            errors.push(format!("manifest.{key} missing/invalid"));
        }
    }
    if let Some(window) = manifest.get("bundle_window").and_then(Value::as_object) {
        for (key, want_string) in [("from", true), ("to", true), ("count", false)] {
            let ok = window
                .get(key)
                .map(|value| if want_string { value.is_string() } else { value.is_u64() })
                .unwrap_or(false);
            if !ok {
                errors.push(format!("manifest.bundle_window.{key} missing/invalid"));
            }
        }
    }
    if let Some(files) = manifest.get("files").and_then(Value::as_array) {
        for (index, entry) in files.iter().enumerate() {
            if !entry.get("name").map(Value::is_string).unwrap_or(false)
                || !entry
                    .get("provenance_hash")
                    .map(Value::is_string)
                    .unwrap_or(false)
            {
                errors.push(format!("manifest.files[{index}] missing/invalid"));
            }
        }
    }
    if manifest.get("schema_version").and_then(Value::as_u64) != Some(1) {
        errors.push("manifest.schema_version must be 1".to_string());
    }
    if manifest.get("hash_algo").and_then(Value::as_str) != Some(sos_enc::HASH_ALGO) {
        errors.push("bad_hash_algo".to_string());
    }
    errors
}

fn verify_entry_chain(
    files: &[Value],
    entries: &BTreeMap<String, Vec<u8>>,
) -> (bool, Vec<String>, Option<String>, Option<String>) {
    let mut errors = Vec::new();
    let mut previous_hash: Option<String> = None;
    let mut first_hash: Option<String> = None;
    let mut last_hash: Option<String> = None;

    for (index, file) in files.iter().enumerate() {
        let name = file["name"].as_str().unwrap_or_default();
        let Some(body) = entries.get(name) else {
            errors.push(format!("missing payload file: {name}"));
            continue;
        };
        let Ok(payload) = serde_json::from_slice::<Value>(body) else {
            errors.push(format!("{name}: bad_json"));
            continue;
        };

        let prev = payload.get("prev_provenance_hash").and_then(Value::as_str);
        let Some(actual) = payload.get("provenance_hash").and_then(Value::as_str) else {
            errors.push(format!("{name}: missing provenance_hash"));
            continue;
        };
        if prev.is_none() {
            errors.push(format!("{name}: missing prev_provenance_hash"));
        }
        if index > 0 && prev != previous_hash.as_deref() {
            errors.push(format!("{name}: chain_discontinuity"));
        }

        let chain_prev = prev.filter(|p| *p != sos_enc::GENESIS_MARKER);
        match compute_provenance_hash(&payload, chain_prev) {
            Ok(expected) if expected == actual => {}
            Ok(_) => errors.push(format!("{name}: payload_hash_mismatch")),
            Err(err) => errors.push(format!("{name}: {err}")),
        }
        if actual != file["provenance_hash"].as_str().unwrap_or_default() {
            errors.push(format!("{name}: manifest_hash_mismatch"));
        }

        if index == 0 {
            first_hash = Some(actual.to_string());
        }
        last_hash = Some(actual.to_string());
        previous_hash = Some(actual.to_string());
    }

    (errors.is_empty(), errors, first_hash, last_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_snapshot;

    fn seed(dir: &Path, count: usize) {
        for n in 0..count {
            append_snapshot(
                dir,
                &format!("run_{n:02}.json"),
                json!({
                    "schema_version": 1,
                    "timestamp": format!("2026-01-01T00:00:{n:02}Z"),
                    "executed": 10 + n as i64,
                    "passed": 10 + n as i64,
                }),
            )
            .unwrap();
        }
    }

    #[test]
    fn export_is_byte_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let provenance = dir.path().join("provenance");
        std::fs::create_dir_all(&provenance).unwrap();
        seed(&provenance, 3);

        let first_out = dir.path().join("bundle_a.tar.gz");
        let second_out = dir.path().join("bundle_b.tar.gz");
        let index = dir.path().join("archive_index.jsonl");
        export_bundle(&provenance, &first_out, &WindowSelection::Last(2), None, &index).unwrap();
        export_bundle(&provenance, &second_out, &WindowSelection::Last(2), None, &index).unwrap();

        let first_bytes = std::fs::read(&first_out).unwrap();
        let second_bytes = std::fs::read(&second_out).unwrap();
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(io::read_jsonl(&index).len(), 2);
    }

    #[test]
    fn exported_bundle_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let provenance = dir.path().join("provenance");
        std::fs::create_dir_all(&provenance).unwrap();
        seed(&provenance, 3);

        let out = dir.path().join("bundle.tar.gz");
        let index = dir.path().join("archive_index.jsonl");
        let export =
            export_bundle(&provenance, &out, &WindowSelection::Last(3), None, &index).unwrap();

        let summary = verify_bundle(&out);
        assert_eq!(summary["verified"], json!(true), "errors: {}", summary["errors"]);
        assert_eq!(
            summary["first_provenance_hash"],
            export.manifest["first_provenance_hash"]
        );
        assert_eq!(
            summary["last_provenance_hash"],
            export.manifest["last_provenance_hash"]
        );

        let runs = read_bundle_runs(&out).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0]["timestamp"], json!("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn tampered_entry_fails_with_payload_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let provenance = dir.path().join("provenance");
        std::fs::create_dir_all(&provenance).unwrap();
        seed(&provenance, 2);

        let out = dir.path().join("bundle.tar.gz");
        let index = dir.path().join("archive_index.jsonl");
        export_bundle(&provenance, &out, &WindowSelection::Last(2), None, &index).unwrap();

        // Rebuild the archive with one mutated payload.
        let mut entries = read_archive_entries(&out).unwrap();
        let key = entries
            .keys()
            .find(|name| name.starts_with("provenance/"))
            .cloned()
            .unwrap();
        let mut payload: Value = serde_json::from_slice(&entries[&key]).unwrap();
        payload["passed"] = json!(0);
        entries.insert(key, serde_json::to_vec_pretty(&payload).unwrap());

        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, body) in &entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(0);
                header.set_cksum();
                builder.append_data(&mut header, name, body.as_slice()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
        std::fs::write(&out, encoder.finish().unwrap()).unwrap();

        let summary = verify_bundle(&out);
        assert_eq!(summary["verified"], json!(false));
        assert!(summary["errors"]
            .as_array()
            .unwrap()
            .iter()
            .any(|error| error.as_str().unwrap().contains("payload_hash_mismatch")));
        assert!(read_bundle_runs(&out).is_err());
    }

    #[test]
    fn broken_window_refuses_to_export() {
        let dir = tempfile::tempdir().unwrap();
        let provenance = dir.path().join("provenance");
        std::fs::create_dir_all(&provenance).unwrap();
        seed(&provenance, 2);

        let target = provenance.join("run_00.json");
        let mut payload = io::read_json(&target).unwrap();
        payload["executed"] = json!(0);
        io::write_json_atomic(&target, &payload).unwrap();

        let out = dir.path().join("bundle.tar.gz");
        let index = dir.path().join("archive_index.jsonl");
        let result = export_bundle(&provenance, &out, &WindowSelection::Last(2), None, &index);
        assert!(matches!(result, Err(ProvenanceError::ChainDiscontinuity(_))));
        assert!(!out.exists());
    }
}
