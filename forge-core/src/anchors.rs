//! Signed anchors over the receipt chain.
//!
//! An anchor pins the receipt-chain tip (and the derived index digest) under
//! a signature. Anchors form their own hash chain: each record carries
//! `anchor_hash`, the marker-prefix chained hash
//! (`prev || "\n" || canonical(record without hash fields)`), and links to
//! its predecessor through `prev_anchor_hash`.

use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::info;

use sos_chain::{chains, BreakReason};
use sos_config::Env;
use sos_enc::hash_canonical;
use sos_envelope::{cached_signer_config, Signer, SignerConfig, Stream};

use crate::receipts::{latest_receipt_hash, verify_receipt_chain};
use crate::witness::publish_witness;
use crate::{iso_now, CoreError};

/// Fields covered by the anchor signature.
const ANCHOR_PAYLOAD_FIELDS: [&str; 8] = [
    "schema_version",
    "anchor_id",
    "created_at",
    "receipt_chain_tip_hash",
    "prev_anchor_hash",
    "receipts_index_sha256",
    "public_key_id",
    "algorithm",
];

/// Outcome of anchor verification.
#[derive(Debug, Clone)]
pub struct AnchorVerification {
    pub status: String,
    pub checked_at: String,
    pub checked_count: usize,
    pub last_anchor_id: Option<String>,
    pub last_anchor_created_at: Option<String>,
    pub last_anchor_tip_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_detail: Option<Value>,
}

impl AnchorVerification {
    pub fn ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "checked_at": self.checked_at,
            "checked_count": self.checked_count,
            "last_anchor_id": self.last_anchor_id,
            "last_anchor_created_at": self.last_anchor_created_at,
            "last_anchor_tip_hash": self.last_anchor_tip_hash,
            "failure_reason": self.failure_reason,
            "failure_detail": self.failure_detail,
        })
    }

    fn failure(reason: &str, checked_at: String, checked_count: usize, detail: Option<Value>) -> Self {
        Self {
            status: "invalid".to_string(),
            checked_at,
            checked_count,
            last_anchor_id: None,
            last_anchor_created_at: None,
            last_anchor_tip_hash: None,
            failure_reason: Some(reason.to_string()),
            failure_detail: detail,
        }
    }
}

/// Create and sign a new anchor over the current receipt tip.
///
/// Requires a configured anchor signer; anchoring with signing off is a
/// configuration error, not a silent no-op. The chain append fills
/// `prev_anchor_hash`, `hash_algo`, and the marker-prefix `anchor_hash`.
pub fn create_anchor(root: &Path, env: &Env) -> Result<Value, CoreError> {
    let config = cached_signer_config(env, Stream::Anchors)?;
    let signer = config.build(Stream::Anchors).ok_or_else(|| {
        CoreError::Other("anchor_create_failed: signing_config_missing".to_string())
    })?;
    signer.verify_available()?;
    let tip_hash = latest_receipt_hash(root)
        .ok_or_else(|| CoreError::Other("anchor_create_failed: receipt_tip_missing".to_string()))?;

    let chain = chains::anchors(root);
    let created_at = iso_now();
    let prev_anchor_hash = chain.tip_hash();
    let index_sha = sos_chain::io::sha256_file(&root.join(sos_config::paths::RECEIPTS_INDEX));
    let short_tip = sos_enc::short_hash(&tip_hash).to_string();
    // Sequence component keeps same-second anchors in chain order.
    let seq = chain.entries_ordered().len();
    let anchor_id = format!("{created_at}-{seq:04}-{short_tip}");

    let mut payload = Map::new();
    payload.insert("schema_version".into(), json!(1));
    payload.insert("anchor_id".into(), json!(anchor_id));
    payload.insert("created_at".into(), json!(created_at));
    payload.insert("receipt_chain_tip_hash".into(), json!(tip_hash));
    payload.insert(
        "prev_anchor_hash".into(),
        prev_anchor_hash.map(Value::from).unwrap_or(Value::Null),
    );
    payload.insert(
        "receipts_index_sha256".into(),
        index_sha.map(Value::from).unwrap_or(Value::Null),
    );
    payload.insert("public_key_id".into(), json!(signer.public_key_id()));
    payload.insert("algorithm".into(), json!(signer.algorithm()));

    let payload_sha = hash_canonical(&Value::Object(payload.clone()))?;
    let signature = signer.sign(&payload_sha)?;

    let mut record = payload;
    record.insert("anchor_payload_sha256".into(), json!(payload_sha));
    record.insert("signature".into(), json!(signature));
    let anchor = chain.append(Value::Object(record))?;
    info!(anchor_id = anchor["anchor_id"].as_str().unwrap_or("unknown"), "anchor created");
    Ok(anchor)
}

/// Publish the newest anchor's payload hash as a witness tag when enabled.
pub fn maybe_publish_anchor_witness(
    root: &Path,
    env: &Env,
    allow_git_tag_publish: bool,
) -> Result<Value, CoreError> {
    if !env.flag("SENTIENTOS_ANCHOR_WITNESS_PUBLISH") {
        let status = json!({"status": "disabled", "published_at": null, "failure": null, "tag": null});
        return Ok(status);
    }
    let anchors = chains::anchors(root).entries_ordered();
    let Some(latest) = anchors.last() else {
        return Ok(json!({"status": "failed", "published_at": null, "failure": "anchor_missing", "tag": null}));
    };
    let payload_sha = latest
        .get("anchor_payload_sha256")
        .and_then(Value::as_str)
        .unwrap_or("");
    let created = latest.get("created_at").and_then(Value::as_str).unwrap_or("");
    let tag = format!(
        "sentientos-receipt-anchor/{}/{}",
        &created[..created.len().min(10)],
        &payload_sha[..payload_sha.len().min(16)]
    );
    let backend = env.str_or("SENTIENTOS_ANCHOR_WITNESS_BACKEND", "file");
    let witness = publish_witness(
        root,
        backend,
        &tag,
        &format!("anchor_payload_sha256: {payload_sha}"),
        &root.join(sos_config::paths::WITNESS_TAGS),
        &json!({"tag": tag, "anchor_payload_sha256": payload_sha, "published_at": created}),
        allow_git_tag_publish,
    )?;
    let status = witness.to_value();
    sos_chain::io::write_json_atomic(&root.join(sos_config::paths::WITNESS_STATUS), &status)?;
    Ok(status)
}

/// Verify the newest `last` anchors against the receipt chain.
///
/// Signature checks run per record; the hash-chain linkage (marker-prefix
/// `anchor_hash` recomputation and `prev_anchor_hash` continuity) is walked
/// by the anchor chain itself.
pub fn verify_receipt_anchors(
    root: &Path,
    env: &Env,
    last: Option<usize>,
    require_tip: bool,
) -> Result<AnchorVerification, CoreError> {
    let checked_at = iso_now();
    let chain = chains::anchors(root);
    let anchors = chain.entries_ordered();
    if anchors.is_empty() {
        return Ok(AnchorVerification {
            status: "missing".to_string(),
            checked_at,
            checked_count: 0,
            last_anchor_id: None,
            last_anchor_created_at: None,
            last_anchor_tip_hash: None,
            failure_reason: None,
            failure_detail: None,
        });
    }

    let receipt_verification = verify_receipt_chain(root, None);
    if !receipt_verification.ok() {
        return Ok(AnchorVerification::failure(
            "receipt_chain_broken",
            checked_at,
            0,
            Some(receipt_verification.to_value()),
        ));
    }
    let receipt_hashes: std::collections::BTreeSet<String> = chains::receipts(root)
        .entries_ordered()
        .iter()
        .filter_map(|entry| entry.get("receipt_hash").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    let config = cached_signer_config(env, Stream::Anchors)?;
    if config == SignerConfig::Off {
        return Ok(AnchorVerification::failure(
            "signing_config_missing",
            checked_at,
            0,
            None,
        ));
    }
    let signer = config.build(Stream::Anchors).expect("config is not off");

    let start = match last {
        Some(n) if n > 0 && n < anchors.len() => anchors.len() - n,
        _ => 0,
    };
    for (idx, anchor) in anchors.iter().enumerate().skip(start) {
        let checked = idx - start + 1;
        let Some(payload_sha) = anchor.get("anchor_payload_sha256").and_then(Value::as_str) else {
            return Ok(AnchorVerification::failure(
                "anchor_payload_sha_missing",
                checked_at,
                checked,
                None,
            ));
        };

        let mut bare = Map::new();
        for field in ANCHOR_PAYLOAD_FIELDS {
            bare.insert(
                field.to_string(),
                anchor.get(field).cloned().unwrap_or(Value::Null),
            );
        }
        let expected_sha = hash_canonical(&Value::Object(bare))?;
        if expected_sha != payload_sha {
            return Ok(AnchorVerification::failure(
                "anchor_payload_sha_mismatch",
                checked_at,
                checked,
                Some(json!({"expected": expected_sha, "found": payload_sha})),
            ));
        }

        let signature = anchor.get("signature").and_then(Value::as_str).unwrap_or("");
        if signature.is_empty() || !signer.verify(payload_sha, signature) {
            return Ok(AnchorVerification::failure(
                "signature_invalid",
                checked_at,
                checked,
                None,
            ));
        }

        let tip = anchor
            .get("receipt_chain_tip_hash")
            .and_then(Value::as_str)
            .unwrap_or("");
        if tip.is_empty() || !receipt_hashes.contains(tip) {
            return Ok(AnchorVerification::failure(
                "anchor_tip_missing",
                checked_at,
                checked,
                None,
            ));
        }
    }

    let linkage = chain.verify(last);
    if !linkage.ok() {
        let reason = linkage
            .break_info
            .as_ref()
            .map(|break_info| anchor_break_tag(&break_info.reason))
            .unwrap_or("anchor_chain_broken");
        return Ok(AnchorVerification::failure(
            reason,
            checked_at,
            linkage.checked_count,
            Some(linkage.to_value()),
        ));
    }

    let latest = anchors.last().expect("non-empty");
    let latest_tip = latest
        .get("receipt_chain_tip_hash")
        .and_then(Value::as_str)
        .map(str::to_string);
    if require_tip {
        let current_tip = latest_receipt_hash(root);
        if latest_tip != current_tip {
            return Ok(AnchorVerification::failure(
                "latest_anchor_not_tip",
                checked_at,
                anchors.len() - start,
                Some(json!({"expected_tip": current_tip, "anchor_tip": latest_tip})),
            ));
        }
    }

    Ok(AnchorVerification {
        status: "ok".to_string(),
        checked_at,
        checked_count: anchors.len() - start,
        last_anchor_id: latest.get("anchor_id").and_then(Value::as_str).map(str::to_string),
        last_anchor_created_at: latest
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string),
        last_anchor_tip_hash: latest_tip,
        failure_reason: None,
        failure_detail: None,
    })
}

fn anchor_break_tag(reason: &BreakReason) -> &'static str {
    match reason {
        BreakReason::HashMissing => "anchor_hash_missing",
        BreakReason::HashMismatch => "anchor_hash_mismatch",
        BreakReason::PrevMismatch => "prev_anchor_hash_mismatch",
        BreakReason::AlgoMismatch => "algo_mismatch",
        BreakReason::BadJson => "bad_json",
    }
}

/// Gate-style wrapper: `(result, fail, warn)` per the enforce/warn env flags.
pub fn maybe_verify_receipt_anchors(
    root: &Path,
    env: &Env,
    last: usize,
) -> Result<(Option<AnchorVerification>, bool, bool), CoreError> {
    let enforce = env.flag("SENTIENTOS_RECEIPT_ANCHOR_ENFORCE");
    let warn = env.flag("SENTIENTOS_RECEIPT_ANCHOR_WARN");
    if !enforce && !warn {
        return Ok((None, false, false));
    }
    let require_tip = env.flag("SENTIENTOS_RECEIPT_ANCHOR_REQUIRE_TIP");
    let result = verify_receipt_anchors(root, env, Some(last), require_tip)?;
    let is_failure = !result.ok() && result.status != "missing";
    Ok((Some(result), enforce && is_failure, warn && !enforce && is_failure))
}
