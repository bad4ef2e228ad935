//! Forge event pulse rows.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};

use sos_chain::io;
use sos_config::paths;

/// Append an event row to `pulse/forge_events.jsonl`.
///
/// Derived-artifact write: failures are surfaced to the caller but never
/// block a mutation decision.
pub fn record_forge_event(
    root: &Path,
    event: &str,
    level: &str,
    fields: Value,
) -> Result<(), sos_chain::ChainError> {
    let mut row = json!({
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "event": event,
        "level": level,
    });
    if let (Some(target), Some(extra)) = (row.as_object_mut(), fields.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    io::append_jsonl(&root.join(paths::FORGE_EVENTS), &row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_rows_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        record_forge_event(dir.path(), "integrity_quarantine_activated", "warning", json!({"incident_id": "inc-1"})).unwrap();
        record_forge_event(dir.path(), "integrity_incident_recorded", "info", json!({})).unwrap();
        let rows = io::read_jsonl(&dir.path().join(paths::FORGE_EVENTS));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["event"], json!("integrity_quarantine_activated"));
        assert_eq!(rows[0]["incident_id"], json!("inc-1"));
    }
}
