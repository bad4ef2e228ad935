//! Process configuration for the forge substrate.
//!
//! All runtime configuration is environment-driven. [`Env`] snapshots the
//! process environment once at operation start so a single tick never observes
//! a mid-flight policy flip; every component reads through the snapshot.

use std::collections::BTreeMap;

pub mod paths;

/// Immutable snapshot of the process environment.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: BTreeMap<String, String>,
}

impl Env {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs. Test seam.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Overlay a single variable on top of an existing snapshot. Test seam.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// String value with a default.
    pub fn str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// `"1"` means enabled; anything else (or unset) means disabled.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map(str::trim) == Some("1")
    }

    /// Tri-state boolean override: `None` when unset or unparsable.
    pub fn bool_override(&self, name: &str) -> Option<bool> {
        self.get(name).map(|raw| raw.trim() == "1")
    }

    /// Integer with a default; unparsable values fall back to the default.
    pub fn int_or(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Integer override: `None` when unset or unparsable.
    pub fn int_override(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|raw| raw.trim().parse::<i64>().ok())
    }

    /// Lowercased trimmed value constrained to an allowed set.
    pub fn mode(&self, name: &str, allowed: &[&str]) -> Option<String> {
        let value = self.get(name)?.trim().to_lowercase();
        allowed.contains(&value.as_str()).then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_requires_literal_one() {
        let env = Env::from_pairs([("A", "1"), ("B", "true"), ("C", "0")]);
        assert!(env.flag("A"));
        assert!(!env.flag("B"));
        assert!(!env.flag("C"));
        assert!(!env.flag("MISSING"));
    }

    #[test]
    fn int_or_falls_back_on_garbage() {
        let env = Env::from_pairs([("N", "17"), ("BAD", "seven")]);
        assert_eq!(env.int_or("N", 3), 17);
        assert_eq!(env.int_or("BAD", 3), 3);
        assert_eq!(env.int_or("MISSING", 3), 3);
    }

    #[test]
    fn mode_normalizes_and_validates() {
        let env = Env::from_pairs([("M", " Lockdown "), ("X", "sideways")]);
        assert_eq!(
            env.mode("M", &["normal", "lockdown"]).as_deref(),
            Some("lockdown")
        );
        assert_eq!(env.mode("X", &["normal", "lockdown"]), None);
        assert_eq!(env.mode("MISSING", &["normal"]), None);
    }
}
