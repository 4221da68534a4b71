//! Plugin manifest and its validation rules.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Permissions a manifest may declare.
pub const PERMISSIONS: &[&str] = &["network", "storage", "timers", "notifications", "settings"];

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version pattern is valid"));

/// Plugin-supplied metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<Compatibility>,
    /// Opaque hash of the published code, used to skip redundant fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Range of host versions a plugin supports. Both bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// Compare two dotted versions part by part.
///
/// Parts are compared numerically; a missing or non-numeric part counts as 0,
/// so `"1.2"` equals `"1.2.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len()).max(3);
    for i in 0..len {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl PluginManifest {
    /// Check every rule and report all violations at once.
    pub fn validate(&self, host_version: &str) -> Result<(), PluginError> {
        let mut violations = Vec::new();

        for (field, value) in [
            ("name", &self.name),
            ("author", &self.author),
            ("description", &self.description),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                violations.push(format!("{field} must not be empty"));
            }
        }

        if !self.version.trim().is_empty() && !VERSION_RE.is_match(&self.version) {
            violations.push(format!(
                "version '{}' must have the form x.y.z",
                self.version
            ));
        }

        for permission in &self.permissions {
            if !PERMISSIONS.contains(&permission.as_str()) {
                violations.push(format!(
                    "unknown permission '{permission}'; allowed: {PERMISSIONS:?}"
                ));
            }
        }

        if let Some(range) = &self.compatibility {
            if let Some(min) = &range.min {
                if compare_versions(host_version, min) == Ordering::Less {
                    violations.push(format!(
                        "requires host version {min} or newer, running {host_version}"
                    ));
                }
            }
            if let Some(max) = &range.max {
                if compare_versions(host_version, max) == Ordering::Greater {
                    violations.push(format!(
                        "requires host version {max} or older, running {host_version}"
                    ));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Validation(violations))
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
