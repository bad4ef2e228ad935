//! Witness publication of signature tips.
//!
//! The `file` backend appends tag rows to a federation-visible JSONL file and
//! is idempotent per tag. The `git` backend creates an annotated tag, but
//! only when mutation is allowed and the repository is clean; replay never
//! reaches it.

use std::path::Path;
use std::process::Command;

use serde_json::{json, Value};
use tracing::warn;

use sos_chain::io;

use crate::{iso_now, CoreError};

pub const WITNESS_OK: &str = "ok";
pub const WITNESS_FAILED: &str = "failed";
pub const WITNESS_DISABLED: &str = "disabled";
pub const WITNESS_SKIPPED_BACKEND_DISABLED: &str = "skipped_backend_disabled";
pub const WITNESS_SKIPPED_MUTATION_DISALLOWED: &str = "skipped_mutation_disallowed";
pub const WITNESS_SKIPPED_REPO_DIRTY: &str = "skipped_repo_dirty";

/// Outcome of one witness attempt.
#[derive(Debug, Clone)]
pub struct WitnessResult {
    pub status: String,
    pub published_at: Option<String>,
    pub failure: Option<String>,
    pub tag: Option<String>,
}

impl WitnessResult {
    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "published_at": self.published_at,
            "failure": self.failure,
            "tag": self.tag,
        })
    }

    fn skipped(status: &str, failure: &str, tag: &str) -> Self {
        Self {
            status: status.to_string(),
            published_at: None,
            failure: Some(failure.to_string()),
            tag: Some(tag.to_string()),
        }
    }
}

/// Publish a witness tag through the selected backend.
pub fn publish_witness(
    root: &Path,
    backend: &str,
    tag: &str,
    message: &str,
    file_path: &Path,
    file_row: &Value,
    allow_git_tag_publish: bool,
) -> Result<WitnessResult, CoreError> {
    match backend {
        "off" | "disabled" | "none" => Ok(WitnessResult::skipped(
            WITNESS_SKIPPED_BACKEND_DISABLED,
            "backend_disabled",
            tag,
        )),
        "file" => {
            let existing: std::collections::BTreeSet<String> = io::read_jsonl(file_path)
                .iter()
                .filter_map(|row| row.get("tag").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if !existing.contains(tag) {
                io::append_jsonl(file_path, file_row)?;
            }
            Ok(WitnessResult {
                status: WITNESS_OK.to_string(),
                published_at: Some(iso_now()),
                failure: None,
                tag: Some(tag.to_string()),
            })
        }
        "git" | "git-tag" => publish_git_tag(root, tag, message, allow_git_tag_publish),
        other => {
            warn!(backend = other, "unknown witness backend");
            Ok(WitnessResult::skipped(
                WITNESS_SKIPPED_BACKEND_DISABLED,
                "backend_disabled",
                tag,
            ))
        }
    }
}

fn publish_git_tag(
    root: &Path,
    tag: &str,
    message: &str,
    allow_git_tag_publish: bool,
) -> Result<WitnessResult, CoreError> {
    if !allow_git_tag_publish {
        return Ok(WitnessResult::skipped(
            WITNESS_SKIPPED_MUTATION_DISALLOWED,
            "mutation_disallowed",
            tag,
        ));
    }
    if !git_repo_clean(root) {
        return Ok(WitnessResult::skipped(
            WITNESS_SKIPPED_REPO_DIRTY,
            "repo_dirty",
            tag,
        ));
    }
    if git_tag_exists(root, tag) {
        return Ok(WitnessResult {
            status: WITNESS_OK.to_string(),
            published_at: None,
            failure: None,
            tag: Some(tag.to_string()),
        });
    }
    let output = Command::new("git")
        .args(["tag", "-a", tag, "-m", message])
        .current_dir(root)
        .output()?;
    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if detail.is_empty() {
            detail = "tag_create_failed".to_string();
        }
        detail.truncate(240);
        return Ok(WitnessResult {
            status: WITNESS_FAILED.to_string(),
            published_at: None,
            failure: Some(detail),
            tag: Some(tag.to_string()),
        });
    }
    Ok(WitnessResult {
        status: WITNESS_OK.to_string(),
        published_at: Some(iso_now()),
        failure: None,
        tag: Some(tag.to_string()),
    })
}

fn git_tag_exists(root: &Path, tag: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/tags/{tag}")])
        .current_dir(root)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn git_repo_clean(root: &Path) -> bool {
    Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(root)
        .output()
        .map(|output| output.status.success() && output.stdout.iter().all(u8::is_ascii_whitespace))
        .unwrap_or(false)
}
