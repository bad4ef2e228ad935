//! Merge-receipt chain operations.

use std::path::Path;

use serde_json::Value;
use tracing::info;

use sos_chain::{chains, Verification};
use sos_config::Env;

use crate::CoreError;

/// Append a merge receipt. The payload must not yet carry hash fields; the
/// chain fills `prev_receipt_hash` and `receipt_hash`.
pub fn append_receipt(root: &Path, payload: Value) -> Result<Value, CoreError> {
    let receipt = chains::receipts(root).append(payload)?;
    info!(
        receipt_id = receipt.get("receipt_id").and_then(|v| v.as_str()).unwrap_or("unknown"),
        "merge receipt appended"
    );
    Ok(receipt)
}

/// Walk the newest `last` receipts.
pub fn verify_receipt_chain(root: &Path, last: Option<usize>) -> Verification {
    chains::receipts(root).verify(last)
}

/// Tip hash of the receipt chain.
pub fn latest_receipt_hash(root: &Path) -> Option<String> {
    chains::receipts(root).tip_hash()
}

/// Rebuild the derived receipts index from primary receipt files.
pub fn rebuild_receipts_index(root: &Path) -> Result<usize, CoreError> {
    Ok(chains::receipts(root).rebuild_index()?.len())
}

/// Gate-style wrapper: `(result, fail, warn)` per the enforce/warn env flags.
/// `None` result means the gate is disabled.
pub fn maybe_verify_receipt_chain(
    root: &Path,
    env: &Env,
    last: usize,
) -> (Option<Verification>, bool, bool) {
    let enforce = env.flag("SENTIENTOS_RECEIPT_CHAIN_ENFORCE");
    let warn = env.flag("SENTIENTOS_RECEIPT_CHAIN_WARN");
    if !enforce && !warn {
        return (None, false, false);
    }
    let result = verify_receipt_chain(root, Some(last));
    let not_ok = !result.ok() && result.status != sos_chain::VerificationStatus::Unknown;
    (Some(result), enforce && not_ok, warn && !enforce && not_ok)
}
