//! Integrity incident records.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use uuid::Uuid;

use sos_chain::io;
use sos_config::paths;

/// One integrity incident, fed to quarantine and the pressure feed.
#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub created_at: String,
    pub severity: String,
    /// `warn` or `enforce`.
    pub enforcement_mode: String,
    pub triggers: Vec<String>,
    pub context: String,
}

impl Incident {
    pub fn new(
        created_at: &str,
        severity: &str,
        enforcement_mode: &str,
        triggers: Vec<String>,
        context: &str,
    ) -> Self {
        Self {
            incident_id: format!("inc-{}", Uuid::new_v4()),
            created_at: created_at.to_string(),
            severity: severity.to_string(),
            enforcement_mode: enforcement_mode.to_string(),
            triggers,
            context: context.to_string(),
        }
    }

    pub fn to_value(&self, quarantine_activated: bool) -> Value {
        json!({
            "schema_version": 1,
            "incident_id": self.incident_id,
            "created_at": self.created_at,
            "severity": self.severity,
            "enforcement_mode": self.enforcement_mode,
            "triggers": self.triggers,
            "context": self.context,
            "quarantine_activated": quarantine_activated,
        })
    }
}

/// Write the incident file and append the pulse feed row.
pub fn write_incident(
    root: &Path,
    incident: &Incident,
    quarantine_activated: bool,
) -> Result<PathBuf, sos_chain::ChainError> {
    let payload = incident.to_value(quarantine_activated);
    let rel = PathBuf::from(paths::INCIDENTS_DIR).join(format!("incident_{}.json", incident.incident_id));
    io::write_json_atomic(&root.join(&rel), &payload)?;
    io::append_jsonl(&root.join(paths::INCIDENT_FEED), &payload)?;
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_lands_in_file_and_feed() {
        let dir = tempfile::tempdir().unwrap();
        let incident = Incident::new(
            "2026-01-01T00:00:00Z",
            "high",
            "enforce",
            vec!["receipt_chain".to_string()],
            "integrity_controller",
        );
        let rel = write_incident(dir.path(), &incident, true).unwrap();
        assert!(dir.path().join(rel).exists());
        let feed = io::read_jsonl(&dir.path().join(paths::INCIDENT_FEED));
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0]["quarantine_activated"], json!(true));
        assert_eq!(feed[0]["incident_id"], json!(incident.incident_id));
    }
}
