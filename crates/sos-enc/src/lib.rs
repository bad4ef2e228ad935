//! Canonical encoding and hashing for forge artifacts.
//!
//! Every hash, signature, and equality compare in the substrate runs over one
//! byte form: JSON with lexicographically sorted keys, `","`/`":"` separators,
//! UTF-8, and a single trailing newline. No other serializer is permitted in
//! the core crates.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Marker substituted for a missing previous hash when chaining.
pub const GENESIS_MARKER: &str = "GENESIS";

/// The only hash algorithm the substrate emits.
pub const HASH_ALGO: &str = "sha256";

/// Encoding error for canonical serialization
#[derive(Debug, thiserror::Error)]
pub enum EncError {
    #[error("unrepresentable value: {0}")]
    Unrepresentable(String),
    #[error("canonical payload must be a JSON object")]
    NotAnObject,
}

/// Canonical bytes for a JSON value: sorted keys, compact separators,
/// trailing newline. Byte-identical across platforms for equal inputs.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, EncError> {
    let mut bytes =
        serde_json::to_vec(value).map_err(|err| EncError::Unrepresentable(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Convert any serializable value into the canonical JSON tree.
///
/// Non-finite numbers and non-string map keys are unrepresentable.
pub fn canonical_value<T: Serialize>(value: &T) -> Result<Value, EncError> {
    serde_json::to_value(value).map_err(|err| EncError::Unrepresentable(err.to_string()))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical bytes of a value.
pub fn hash_canonical(value: &Value) -> Result<String, EncError> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Receipt-style hash: strip the named fields from the payload and hash the
/// remaining canonical object. The prev link stays inside the payload.
pub fn hash_payload_without(payload: &Value, strip: &[&str]) -> Result<String, EncError> {
    let material = object_without(payload, strip)?;
    hash_canonical(&Value::Object(material))
}

/// Anchor-style chained hash: `(prev or GENESIS) || "\n" || canonical(material)`
/// where `material` is the payload with the named hash fields stripped.
pub fn compute_chained_hash(
    payload: &Value,
    prev_hash: Option<&str>,
    strip: &[&str],
) -> Result<String, EncError> {
    let material = object_without(payload, strip)?;
    let marker = match prev_hash {
        Some(prev) if !prev.is_empty() => prev,
        _ => GENESIS_MARKER,
    };
    let mut hasher = Sha256::new();
    hasher.update(marker.as_bytes());
    hasher.update(b"\n");
    hasher.update(&canonical_bytes(&Value::Object(material))?);
    Ok(hex::encode(hasher.finalize()))
}

fn object_without(payload: &Value, strip: &[&str]) -> Result<Map<String, Value>, EncError> {
    let object = payload.as_object().ok_or(EncError::NotAnObject)?;
    let mut material = object.clone();
    for field in strip {
        material.remove(*field);
    }
    Ok(material)
}

/// Short prefix of a hex digest, used in generated file names.
pub fn short_hash(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}
