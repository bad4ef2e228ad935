//! Signed envelopes over forge artifacts.
//!
//! An envelope attests the canonical hash of an underlying artifact and links
//! to the previous envelope of the same stream through `prev_sig_hash`,
//! forming a signature chain per stream. Signing modes are selected from the
//! environment per stream: `off`, `hmac-test` (test-only), or `ssh`
//! (ed25519 via `ssh-keygen`).

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::debug;

use sos_chain::io;
use sos_config::Env;
use sos_enc::{hash_canonical, hash_payload_without, EncError};

pub mod signer;

pub use signer::{
    cached_signer_config, reset_key_cache, HmacTestSigner, Signer, SignerConfig, SshKeygenSigner,
    ALGO_ED25519, ALGO_HMAC_TEST,
};

/// Envelope-layer error. Display forms carry the substrate's reason tags.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("signer_disabled")]
    SignerDisabled,
    #[error("signing_config_missing: {0}")]
    SigningConfigMissing(String),
    #[error("unsupported_algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("ssh_sign_failed: {0}")]
    SshSignFailed(String),
    #[error(transparent)]
    Enc(#[from] EncError),
    #[error(transparent)]
    Chain(#[from] sos_chain::ChainError),
}

/// Signature streams. Each stream has its own env prefix, ssh namespace, and
/// signature index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Receipts,
    Anchors,
    Rollup,
    AttestationSnapshot,
    Strategic,
    CatalogCheckpoint,
    OperatorReport,
}

impl Stream {
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Stream::Receipts => "SENTIENTOS_RECEIPT",
            Stream::Anchors => "SENTIENTOS_RECEIPT_ANCHOR",
            Stream::Rollup => "SENTIENTOS_ROLLUP",
            Stream::AttestationSnapshot => "SENTIENTOS_ATTESTATION_SNAPSHOT",
            Stream::Strategic => "SENTIENTOS_STRATEGIC",
            Stream::CatalogCheckpoint => "SENTIENTOS_CATALOG_CHECKPOINT",
            Stream::OperatorReport => "SENTIENTOS_OPERATOR_REPORT",
        }
    }

    /// `ssh-keygen -Y` namespace for the stream.
    pub fn namespace(&self) -> &'static str {
        match self {
            Stream::Receipts => "sentientos-receipt",
            Stream::Anchors => "sentientos-receipt-anchor",
            Stream::Rollup => "sentientos-rollup",
            Stream::AttestationSnapshot => "sentientos-attestation-snapshot",
            Stream::Strategic => "sentientos-strategic",
            Stream::CatalogCheckpoint => "sentientos-catalog-checkpoint",
            Stream::OperatorReport => "sentientos-operator-report",
        }
    }

    /// Envelope `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Stream::Receipts => "receipt",
            Stream::Anchors => "receipt_anchor",
            Stream::Rollup => "rollup",
            Stream::AttestationSnapshot => "attestation_snapshot",
            Stream::Strategic => "strategic",
            Stream::CatalogCheckpoint => "catalog_checkpoint",
            Stream::OperatorReport => "operator_report",
        }
    }

    pub fn default_key_id(&self) -> &'static str {
        match self {
            Stream::Receipts => "receipt",
            Stream::Anchors => "receipt-anchor",
            Stream::Rollup => "rollup",
            Stream::AttestationSnapshot => "snapshot",
            Stream::Strategic => "strategic",
            Stream::CatalogCheckpoint => "catalog-checkpoint",
            Stream::OperatorReport => "operator-report",
        }
    }
}

/// Filesystem layout of one signature stream.
#[derive(Debug, Clone)]
pub struct StreamPaths {
    pub sig_dir: PathBuf,
    pub index_path: PathBuf,
}

impl StreamPaths {
    pub fn new(sig_dir: PathBuf) -> Self {
        let index_path = sig_dir.join("signatures_index.jsonl");
        Self {
            sig_dir,
            index_path,
        }
    }
}

/// The artifact an envelope attests.
#[derive(Debug, Clone)]
pub struct ObjectRef<'a> {
    pub object_id: &'a str,
    pub created_at: &'a str,
    /// Repository-relative path of the attested artifact.
    pub rel_path: &'a str,
    pub payload: &'a Value,
}

/// Reason tags for a failed stream verification.
pub const REASON_SIG_PAYLOAD_SHA_MISMATCH: &str = "sig_payload_sha_mismatch";
pub const REASON_SIGNATURE_INVALID: &str = "signature_invalid";
pub const REASON_SIG_HASH_MISMATCH: &str = "sig_hash_mismatch";
pub const REASON_PREV_SIG_HASH_MISMATCH: &str = "prev_sig_hash_mismatch";
pub const REASON_OBJECT_SHA_MISMATCH: &str = "object_sha_mismatch";
pub const REASON_UNSUPPORTED_ALGORITHM: &str = "unsupported_algorithm";
pub const REASON_SIGNER_DISABLED: &str = "signer_disabled";
pub const REASON_VERIFY_DISABLED: &str = "verify_disabled";
pub const REASON_SIGNATURE_MISSING: &str = "signature_missing";

/// Outcome of verifying the newest slice of a signature stream.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub ok: bool,
    pub status: String,
    pub reason: Option<String>,
    pub checked_n: usize,
    pub last_ok_hash: Option<String>,
}

impl VerifyResult {
    fn skipped(reason: &str) -> Self {
        Self {
            ok: true,
            status: "skipped".to_string(),
            reason: Some(reason.to_string()),
            checked_n: 0,
            last_ok_hash: None,
        }
    }

    fn failed(enforce: bool, checked_n: usize, last_ok_hash: Option<String>, reason: &str) -> Self {
        Self {
            ok: false,
            status: if enforce { "fail" } else { "warn" }.to_string(),
            reason: Some(reason.to_string()),
            checked_n,
            last_ok_hash,
        }
    }
}

/// Per-stream verification policy parsed from the environment.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    pub enabled: bool,
    pub last_n: usize,
    pub warn: bool,
    pub enforce: bool,
}

/// Parse `<prefix>_VERIFY`, `<prefix>_VERIFY_LAST_N`, `<prefix>_WARN`,
/// `<prefix>_ENFORCE`. When neither warn nor enforce is set, warn is implied.
pub fn parse_verify_policy(env: &Env, prefix: &str, default_last_n: usize) -> VerifyPolicy {
    let enabled = env.flag(&format!("{prefix}_VERIFY"));
    let last_n = env
        .int_or(&format!("{prefix}_VERIFY_LAST_N"), default_last_n as i64)
        .max(1) as usize;
    let enforce = env.flag(&format!("{prefix}_ENFORCE"));
    let mut warn = env.flag(&format!("{prefix}_WARN"));
    if !enforce && !warn {
        warn = true;
    }
    VerifyPolicy {
        enabled,
        last_n,
        warn,
        enforce,
    }
}

/// Fields the signature covers (everything except the signature block).
const BARE_FIELDS: [&str; 9] = [
    "schema_version",
    "kind",
    "object_id",
    "created_at",
    "path",
    "object_sha256",
    "prev_sig_hash",
    "public_key_id",
    "algorithm",
];

/// Sign an artifact into the stream, or return `None` when signing is off.
///
/// Writes the envelope file atomically and appends the stream's signature
/// index row while holding the stream's writer lock.
pub fn maybe_sign(
    root: &Path,
    env: &Env,
    stream: Stream,
    paths: &StreamPaths,
    object: &ObjectRef<'_>,
) -> Result<Option<Value>, EnvelopeError> {
    let config = cached_signer_config(env, stream)?;
    let Some(signer) = config.build(stream) else {
        return Ok(None);
    };
    signer.verify_available()?;

    let sig_dir = root.join(&paths.sig_dir);
    let index_path = root.join(&paths.index_path);
    std::fs::create_dir_all(&sig_dir).map_err(sos_chain::ChainError::Io)?;
    let _guard = sos_chain::FileLock::acquire_blocking(&sig_dir.join(".lock"))?;

    let prev_sig_hash = latest_sig_hash(&index_path);
    let object_sha256 = hash_canonical(object.payload)?;

    let mut bare = Map::new();
    bare.insert("schema_version".into(), json!(1));
    bare.insert("kind".into(), json!(stream.kind()));
    bare.insert("object_id".into(), json!(object.object_id));
    bare.insert("created_at".into(), json!(object.created_at));
    bare.insert("path".into(), json!(object.rel_path));
    bare.insert("object_sha256".into(), json!(object_sha256));
    bare.insert(
        "prev_sig_hash".into(),
        prev_sig_hash.as_deref().map(Value::from).unwrap_or(Value::Null),
    );
    bare.insert("public_key_id".into(), json!(signer.public_key_id()));
    bare.insert("algorithm".into(), json!(signer.algorithm()));

    let sig_payload_sha256 = hash_canonical(&Value::Object(bare.clone()))?;
    let signature = signer.sign(&sig_payload_sha256)?;

    let mut envelope = bare;
    envelope.insert("sig_payload_sha256".into(), json!(sig_payload_sha256));
    envelope.insert("signature".into(), json!(signature));
    let envelope_value = Value::Object(envelope);
    let sig_hash = hash_payload_without(&envelope_value, &["sig_hash"])?;
    let mut envelope = envelope_value;
    envelope
        .as_object_mut()
        .expect("envelope is an object")
        .insert("sig_hash".into(), json!(sig_hash));

    let file_name = format!("sig_{}.json", safe_ts(object.created_at));
    io::write_json_atomic(&sig_dir.join(file_name), &envelope)?;
    io::append_jsonl(&index_path, &envelope)?;
    debug!(stream = stream.kind(), sig_hash = %sig_hash, "signed envelope");
    Ok(Some(envelope))
}

/// Verify the newest `last_n` envelopes of a stream.
///
/// Checks, in order: algorithm recognized, payload hash, signature, envelope
/// hash, prev-hash linkage, attested object hash. The first mismatch yields
/// its reason tag.
pub fn verify_stream(
    root: &Path,
    env: &Env,
    stream: Stream,
    paths: &StreamPaths,
    last_n: usize,
    enforce: bool,
) -> Result<VerifyResult, EnvelopeError> {
    let config = cached_signer_config(env, stream)?;
    let Some(signer) = config.build(stream) else {
        return Ok(VerifyResult::skipped(REASON_SIGNER_DISABLED));
    };

    let rows = recent_rows(root, paths, last_n);
    if rows.is_empty() {
        return Ok(VerifyResult::skipped(REASON_SIGNATURE_MISSING));
    }

    let mut prev_hash: Option<String> = None;
    let mut checked_n = 0usize;
    let mut last_ok_hash: Option<String> = None;
    for row in &rows {
        let algorithm = row.get("algorithm").and_then(Value::as_str).unwrap_or("");
        if algorithm != signer.algorithm() {
            return Ok(VerifyResult::failed(
                enforce,
                checked_n,
                last_ok_hash,
                REASON_UNSUPPORTED_ALGORITHM,
            ));
        }

        let mut bare = Map::new();
        for field in BARE_FIELDS {
            bare.insert(
                field.to_string(),
                row.get(field).cloned().unwrap_or(Value::Null),
            );
        }
        let payload_sha = hash_canonical(&Value::Object(bare))?;
        if row.get("sig_payload_sha256").and_then(Value::as_str) != Some(payload_sha.as_str()) {
            return Ok(VerifyResult::failed(
                enforce,
                checked_n,
                last_ok_hash,
                REASON_SIG_PAYLOAD_SHA_MISMATCH,
            ));
        }

        let signature = row.get("signature").and_then(Value::as_str).unwrap_or("");
        if !signer.verify(&payload_sha, signature) {
            return Ok(VerifyResult::failed(
                enforce,
                checked_n,
                last_ok_hash,
                REASON_SIGNATURE_INVALID,
            ));
        }

        let sig_hash = row.get("sig_hash").and_then(Value::as_str);
        let expected_sig_hash = hash_payload_without(row, &["sig_hash"])?;
        if sig_hash != Some(expected_sig_hash.as_str()) {
            return Ok(VerifyResult::failed(
                enforce,
                checked_n,
                last_ok_hash,
                REASON_SIG_HASH_MISMATCH,
            ));
        }

        if prev_hash.is_some()
            && row.get("prev_sig_hash").and_then(Value::as_str) != prev_hash.as_deref()
        {
            return Ok(VerifyResult::failed(
                enforce,
                checked_n,
                last_ok_hash,
                REASON_PREV_SIG_HASH_MISMATCH,
            ));
        }

        if let Some(rel) = row.get("path").and_then(Value::as_str) {
            if let Some(artifact) = io::read_json(&root.join(rel)) {
                let object_sha = hash_canonical(&artifact)?;
                if row.get("object_sha256").and_then(Value::as_str) != Some(object_sha.as_str()) {
                    return Ok(VerifyResult::failed(
                        enforce,
                        checked_n,
                        last_ok_hash,
                        REASON_OBJECT_SHA_MISMATCH,
                    ));
                }
            }
        }

        prev_hash = sig_hash.map(str::to_string);
        checked_n += 1;
        last_ok_hash = prev_hash.clone();
    }

    Ok(VerifyResult {
        ok: true,
        status: "ok".to_string(),
        reason: None,
        checked_n,
        last_ok_hash,
    })
}

/// Tip `sig_hash` of a stream index, if any.
pub fn latest_sig_hash(index_path: &Path) -> Option<String> {
    let rows = io::read_jsonl(index_path);
    rows.iter()
        .rev()
        .find_map(|row| row.get("sig_hash").and_then(Value::as_str))
        .map(str::to_string)
}

fn recent_rows(root: &Path, paths: &StreamPaths, last_n: usize) -> Vec<Value> {
    let mut rows = io::read_jsonl(&root.join(&paths.index_path));
    if rows.is_empty() {
        let sig_dir = root.join(&paths.sig_dir);
        let Ok(read_dir) = std::fs::read_dir(&sig_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("sig_") && name.ends_with(".json"))
            .collect();
        names.sort();
        rows = names
            .iter()
            .filter_map(|name| io::read_json(&sig_dir.join(name)))
            .collect();
    }
    if last_n > 0 && rows.len() > last_n {
        rows.split_off(rows.len() - last_n)
    } else {
        rows
    }
}

/// Timestamp rendered safe for file names.
pub fn safe_ts(ts: &str) -> String {
    ts.replace([':', '.'], "-")
}
