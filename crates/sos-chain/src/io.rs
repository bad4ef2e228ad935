//! Atomic JSON / JSONL filesystem primitives.
//!
//! Primary artifacts are written temp-then-rename; index rows are appended
//! with an fsync. Readers take no lock and retry a read once to tolerate an
//! in-progress rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ChainError;

/// Lenient JSON object read: `None` on missing file, parse failure, or
/// non-object payload. Retries once to ride out a concurrent rename.
pub fn read_json(path: &Path) -> Option<Value> {
    for attempt in 0..2 {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) if value.is_object() => return Some(value),
                _ => return None,
            },
            Err(_) if attempt == 0 => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Read a JSONL file, skipping blank and corrupt lines.
pub fn read_jsonl(path: &Path) -> Vec<Value> {
    read_jsonl_counting(path).0
}

/// Read a JSONL file, also counting corrupt (unparsable or non-object) rows.
pub fn read_jsonl_counting(path: &Path) -> (Vec<Value>, usize) {
    let Ok(text) = fs::read_to_string(path) else {
        return (Vec::new(), 0);
    };
    let mut rows = Vec::new();
    let mut corrupt = 0;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => rows.push(value),
            _ => corrupt += 1,
        }
    }
    (rows, corrupt)
}

/// Write a JSON object atomically (temp file in the same directory, rename).
pub fn write_json_atomic(path: &Path, payload: &Value) -> Result<(), ChainError> {
    let body = format!(
        "{}\n",
        serde_json::to_string_pretty(payload).map_err(|err| ChainError::BadJson(err.to_string()))?
    );
    write_atomic(path, body.as_bytes())
}

/// Append one compact JSON row to a JSONL file and fsync it.
pub fn append_jsonl(path: &Path, row: &Value) -> Result<(), ChainError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ChainError::Io)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(ChainError::Io)?;
    let line = format!(
        "{}\n",
        serde_json::to_string(row).map_err(|err| ChainError::BadJson(err.to_string()))?
    );
    file.write_all(line.as_bytes()).map_err(ChainError::Io)?;
    file.sync_data().map_err(ChainError::Io)?;
    Ok(())
}

/// Replace an entire JSONL file atomically.
pub fn write_jsonl_atomic(path: &Path, rows: &[Value]) -> Result<(), ChainError> {
    let mut body = String::new();
    for row in rows {
        body.push_str(
            &serde_json::to_string(row).map_err(|err| ChainError::BadJson(err.to_string()))?,
        );
        body.push('\n');
    }
    write_atomic(path, body.as_bytes())
}

/// Hex SHA-256 of a file's bytes; `None` when the file is absent.
pub fn sha256_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ChainError> {
    let parent = path.parent().ok_or_else(|| {
        ChainError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        ))
    })?;
    fs::create_dir_all(parent).map_err(ChainError::Io)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path).map_err(ChainError::Io)?;
        tmp.write_all(bytes).map_err(ChainError::Io)?;
        tmp.sync_data().map_err(ChainError::Io)?;
    }
    fs::rename(&tmp_path, path).map_err(|_| ChainError::TmpRenameFailed)?;
    Ok(())
}
