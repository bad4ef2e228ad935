//! Concrete chain layouts used across the substrate.

use std::path::Path;

use sos_config::paths;

use crate::{ChainConfig, GenesisMode, HashChain, HashVariant};

/// Merge-receipt chain: null genesis, hash over the payload with the prev
/// link embedded and only `receipt_hash` stripped.
pub fn receipts(root: &Path) -> HashChain {
    HashChain::new(ChainConfig {
        dir: root.join(paths::RECEIPTS_DIR),
        file_prefix: "merge_receipt_".to_string(),
        index_name: "receipts_index.jsonl".to_string(),
        id_field: "receipt_id".to_string(),
        created_at_field: "created_at".to_string(),
        hash_field: "receipt_hash".to_string(),
        prev_field: "prev_receipt_hash".to_string(),
        genesis: GenesisMode::NullPrev,
        variant: HashVariant::PayloadWithoutHashField,
        index_fields: vec!["pr_number".to_string(), "head_sha".to_string()],
    })
}

/// Signed-anchor chain: null genesis, marker-prefix hash
/// (`prev || "\n" || canonical(record without hash fields)`).
pub fn anchors(root: &Path) -> HashChain {
    HashChain::new(ChainConfig {
        dir: root.join(paths::ANCHORS_DIR),
        file_prefix: "anchor_".to_string(),
        index_name: "anchors_index.jsonl".to_string(),
        id_field: "anchor_id".to_string(),
        created_at_field: "created_at".to_string(),
        hash_field: "anchor_hash".to_string(),
        prev_field: "prev_anchor_hash".to_string(),
        genesis: GenesisMode::NullPrev,
        variant: HashVariant::ChainedMarker,
        index_fields: vec![
            "receipt_chain_tip_hash".to_string(),
            "anchor_payload_sha256".to_string(),
            "public_key_id".to_string(),
            "algorithm".to_string(),
        ],
    })
}
