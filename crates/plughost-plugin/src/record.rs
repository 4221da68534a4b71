//! Persisted plugin records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;
use crate::manifest::PluginManifest;

/// Where a plugin's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "camelCase")]
pub enum PluginOrigin {
    Local,
    #[serde(rename_all = "camelCase")]
    Remote {
        source: String,
        #[serde(default)]
        auto_update: bool,
    },
}

impl PluginOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, PluginOrigin::Local)
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            PluginOrigin::Local => None,
            PluginOrigin::Remote { source, .. } => Some(source),
        }
    }

    pub fn auto_update(&self) -> bool {
        matches!(self, PluginOrigin::Remote { auto_update: true, .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub start_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_uptime_ms: Option<u64>,
}

/// One plugin's full description and runtime metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: String,
    #[serde(flatten)]
    pub origin: PluginOrigin,
    #[serde(default)]
    pub manifest: PluginManifest,
    #[serde(default)]
    pub code: String,
    /// Whether the user wants the plugin running.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub usage_stats: UsageStats,
    /// Host display hints; passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_integration: Option<Value>,
}

impl PluginRecord {
    /// A fresh record with no code and an empty manifest.
    pub fn new(id: impl Into<String>, origin: PluginOrigin) -> Self {
        Self {
            id: id.into(),
            origin,
            manifest: PluginManifest::default(),
            code: String::new(),
            enabled: false,
            enabled_at: None,
            disabled_at: None,
            last_updated: None,
            last_error: None,
            usage_stats: UsageStats::default(),
            ui_integration: None,
        }
    }

    /// Decode a stored record.
    ///
    /// Records written before origins were tagged carry no `origin` field;
    /// their origin is inferred from the presence of a `source`. Returns
    /// whether such an inference happened so the caller can rewrite it.
    pub fn from_stored(mut value: Value) -> Result<(Self, bool), PluginError> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| PluginError::InvalidRecord("record is not an object".into()))?;

        let mut migrated = false;
        if !obj.contains_key("origin") {
            let has_source = obj
                .get("source")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            let origin = if has_source { "remote" } else { "local" };
            obj.insert("origin".into(), Value::String(origin.into()));
            migrated = true;
        }

        let record = serde_json::from_value(value)?;
        Ok((record, migrated))
    }

    /// Record `error` as the latest failure and count it.
    pub(crate) fn note_error(&mut self, error: &PluginError) {
        self.last_error = Some(error.to_string());
        self.usage_stats.error_count += 1;
    }
}

/// Fields to merge onto an existing record. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub manifest: Option<PluginManifest>,
    pub code: Option<String>,
    pub enabled: Option<bool>,
    /// Only applies to remote records.
    pub auto_update: Option<bool>,
    /// Only applies to remote records.
    pub source: Option<String>,
    pub ui_integration: Option<Value>,
}

impl RecordPatch {
    pub fn apply(self, record: &mut PluginRecord) {
        if let Some(manifest) = self.manifest {
            record.manifest = manifest;
        }
        if let Some(code) = self.code {
            record.code = code;
        }
        if let Some(enabled) = self.enabled {
            record.enabled = enabled;
        }
        if let PluginOrigin::Remote {
            source,
            auto_update,
        } = &mut record.origin
        {
            if let Some(new_source) = self.source {
                *source = new_source;
            }
            if let Some(flag) = self.auto_update {
                *auto_update = flag;
            }
        }
        if let Some(hint) = self.ui_integration {
            record.ui_integration = Some(hint);
        }
    }
}

/// Input for installing a locally authored plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLocalPlugin {
    pub manifest: PluginManifest,
    pub code: String,
    pub ui_integration: Option<Value>,
}

impl NewLocalPlugin {
    pub fn new(manifest: PluginManifest, code: impl Into<String>) -> Self {
        Self {
            manifest,
            code: code.into(),
            ui_integration: None,
        }
    }

    /// Parse an untyped install request.
    ///
    /// `code` must be a string, `manifest` must be present and `autoUpdate`,
    /// if given, must be a boolean.
    pub fn from_json(value: &Value) -> Result<Self, PluginError> {
        let obj = value
            .as_object()
            .ok_or_else(|| PluginError::InvalidRecord("record must be an object".into()))?;

        let code = obj
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::InvalidRecord("code must be a string".into()))?;

        let manifest = match obj.get("manifest") {
            Some(m) if m.is_object() => serde_json::from_value(m.clone())
                .map_err(|e| PluginError::InvalidRecord(format!("invalid manifest: {e}")))?,
            _ => return Err(PluginError::InvalidRecord("manifest is missing".into())),
        };

        if let Some(flag) = obj.get("autoUpdate") {
            if !flag.is_boolean() {
                return Err(PluginError::InvalidRecord(
                    "autoUpdate must be a boolean".into(),
                ));
            }
        }

        Ok(Self {
            manifest,
            code: code.to_string(),
            ui_integration: obj.get("uiIntegration").cloned(),
        })
    }
}
