//! Export and import of the whole runtime state.
//!
//! A snapshot carries the global config store, and per plugin its record
//! (manifest, code, enabled intent) plus optionally its private store:
//!
//! ```json
//! {
//!   "config": { "theme": "dark" },
//!   "localPlugins":  { "<id>":     [ {"enabled": true, "code": "…", "manifest": {…}} ] },
//!   "remotePlugins": { "<source>": [ {"enabled": false, "code": "…", "manifest": {…}, "autoUpdate": true},
//!                                    { "<key>": <value> } ] }
//! }
//! ```

use chrono::Utc;
use indexmap::IndexMap;
use plughost_store::Entries;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::record::{PluginOrigin, PluginRecord, RecordPatch};
use crate::runtime::Runtime;

// ─── Format ─────────────────────────────────────────────────────────────

/// The portable part of a plugin record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub enabled: bool,
    pub code: String,
    pub manifest: PluginManifest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
}

/// One plugin in a snapshot. Serialized as `[record]` or `[record, data]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct SnapshotEntry {
    pub record: SnapshotRecord,
    /// Private store contents, when exported with data.
    pub data: Option<Entries>,
}

impl TryFrom<Vec<Value>> for SnapshotEntry {
    type Error = String;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        let mut items = items.into_iter();
        let (Some(record), data, None) = (items.next(), items.next(), items.next()) else {
            return Err("entry must have one or two elements".into());
        };
        let record = serde_json::from_value(record).map_err(|e| e.to_string())?;
        let data = data
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| e.to_string())?;
        Ok(Self { record, data })
    }
}

impl From<SnapshotEntry> for Vec<Value> {
    fn from(entry: SnapshotEntry) -> Self {
        let mut items = vec![serde_json::to_value(entry.record).unwrap_or(Value::Null)];
        if let Some(data) = entry.data {
            items.push(Value::Object(data.into_iter().collect()));
        }
        items
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub config: Entries,
    /// Keyed by plugin id.
    pub local_plugins: IndexMap<String, SnapshotEntry>,
    /// Keyed by source URL.
    pub remote_plugins: IndexMap<String, SnapshotEntry>,
}

impl Snapshot {
    /// Verify `value` and decode it.
    pub fn from_value(value: Value) -> Result<Self, PluginError> {
        verify(&value)?;
        serde_json::from_value(value).map_err(|e| PluginError::Snapshot(e.to_string()))
    }
}

/// Structural validation of an untyped snapshot.
///
/// Returns the first problem found.
pub fn verify(value: &Value) -> Result<(), PluginError> {
    let fail = |msg: String| -> Result<(), PluginError> { Err(PluginError::Snapshot(msg)) };

    let Some(root) = value.as_object() else {
        return fail("snapshot must be an object".into());
    };
    if !root.get("config").is_some_and(Value::is_object) {
        return fail("config must be an object".into());
    }

    for section in ["localPlugins", "remotePlugins"] {
        let Some(entries) = root.get(section).and_then(Value::as_object) else {
            return fail(format!("{section} must be an object"));
        };
        for (key, entry) in entries {
            if section == "remotePlugins" && url::Url::parse(key).is_err() {
                return fail(format!("{section}: '{key}' is not a valid URL"));
            }
            if let Err(msg) = verify_entry(entry) {
                return fail(format!("{section}.{key}: {msg}"));
            }
        }
    }
    Ok(())
}

fn verify_entry(entry: &Value) -> Result<(), String> {
    let items = entry.as_array().ok_or("entry must be an array")?;
    if !(1..=2).contains(&items.len()) {
        return Err(format!(
            "entry must have one or two elements, found {}",
            items.len()
        ));
    }

    let record = items[0].as_object().ok_or("record must be an object")?;
    if !record.get("enabled").is_some_and(Value::is_boolean) {
        return Err("enabled must be a boolean".into());
    }
    if !record.get("code").is_some_and(Value::is_string) {
        return Err("code must be a string".into());
    }
    if !record.get("manifest").is_some_and(Value::is_object) {
        return Err("manifest must be an object".into());
    }
    if record.get("autoUpdate").is_some_and(|v| !v.is_boolean()) {
        return Err("autoUpdate must be a boolean".into());
    }

    if let Some(data) = items.get(1) {
        if !data.is_object() {
            return Err("store data must be an object".into());
        }
    }
    Ok(())
}

/// Id for a remote source with no matching record: the last non-empty path
/// segment of its URL.
fn id_from_source(source: &str) -> Option<String> {
    let url = url::Url::parse(source).ok()?;
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

// ─── Import / export ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportFailure {
    /// Plugin id, or the source URL when no id could be derived.
    pub plugin: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub failures: Vec<ImportFailure>,
}

impl Runtime {
    /// Export the config store and the selected plugins.
    ///
    /// `selection` maps plugin ids to whether their private store is
    /// included. Plugins carrying a host display hint are skipped.
    pub async fn export(&self, selection: &IndexMap<String, bool>) -> Result<Snapshot, PluginError> {
        let registry = self.registry();
        registry.ready().await;

        let mut snapshot = Snapshot {
            config: registry.config().entries(),
            ..Default::default()
        };

        for (id, &include_data) in selection {
            let record = registry.get(id)?;
            if record.ui_integration.is_some() {
                tracing::debug!(plugin = %id, "skipping host-managed plugin in export");
                continue;
            }

            let data = if include_data {
                let store = self.plugin_store(id)?;
                store.ready().await;
                Some(store.entries())
            } else {
                None
            };

            let PluginRecord {
                origin,
                manifest,
                code,
                enabled,
                ..
            } = record;
            let entry = SnapshotEntry {
                record: SnapshotRecord {
                    enabled,
                    code,
                    manifest,
                    auto_update: origin.source().map(|_| origin.auto_update()),
                },
                data,
            };
            match origin {
                PluginOrigin::Local => snapshot.local_plugins.insert(id.clone(), entry),
                PluginOrigin::Remote { source, .. } => {
                    snapshot.remote_plugins.insert(source, entry)
                }
            };
        }

        tracing::info!(
            local = snapshot.local_plugins.len(),
            remote = snapshot.remote_plugins.len(),
            "exported snapshot"
        );
        Ok(snapshot)
    }

    /// Whether importing `snapshot` would touch existing plugins.
    pub fn would_conflict(&self, snapshot: &Snapshot) -> bool {
        let registry = self.registry();
        snapshot.local_plugins.keys().any(|id| registry.contains(id))
            || snapshot
                .remote_plugins
                .keys()
                .any(|source| !registry.find_by_source(source).is_empty())
    }

    /// Merge `snapshot` into the running instance.
    ///
    /// Entries are independent: a failing entry is logged and reported, and
    /// never undoes or stops the others.
    pub async fn import(&self, snapshot: Snapshot) -> ImportReport {
        let registry = self.registry();
        registry.ready().await;
        let mut report = ImportReport::default();

        for (key, value) in &snapshot.config {
            if let Err(e) = registry.config().set(key.clone(), value) {
                tracing::warn!(key = %key, "failed to import config value: {e}");
            }
        }

        for (id, entry) in snapshot.local_plugins {
            let result = self.import_entry(&id, PluginOrigin::Local, entry).await;
            report.push(id, result);
        }

        for (source, entry) in snapshot.remote_plugins {
            let id = match self.resolve_remote(&source).await {
                Ok(id) => id,
                Err(e) => {
                    report.push(source, Err(e));
                    continue;
                }
            };
            let origin = PluginOrigin::Remote {
                source,
                auto_update: entry.record.auto_update.unwrap_or(false),
            };
            let result = self.import_entry(&id, origin, entry).await;
            report.push(id, result);
        }

        tracing::info!(
            imported = report.imported.len(),
            failed = report.failures.len(),
            "imported snapshot"
        );
        report
    }

    /// The id a remote snapshot entry merges into.
    ///
    /// Extra records sharing the source are removed.
    async fn resolve_remote(&self, source: &str) -> Result<String, PluginError> {
        let mut matches = self.registry().find_by_source(source).into_iter();
        if let Some(first) = matches.next() {
            for duplicate in matches {
                tracing::warn!(
                    plugin = %duplicate.id,
                    source = %source,
                    "removing duplicate remote plugin"
                );
                self.remove(&duplicate.id).await?;
            }
            return Ok(first.id);
        }

        let id = id_from_source(source).ok_or_else(|| {
            PluginError::Snapshot(format!("cannot derive a plugin id from '{source}'"))
        })?;
        if self.registry().contains(&id) {
            tracing::warn!(plugin = %id, source = %source, "imported source merges into existing plugin");
        }
        Ok(id)
    }

    async fn import_entry(
        &self,
        id: &str,
        origin: PluginOrigin,
        entry: SnapshotEntry,
    ) -> Result<(), PluginError> {
        if self.is_loaded(id) {
            self.stop(id).await?;
        }

        if let Some(data) = entry.data {
            let store = self.plugin_store(id)?;
            store.ready().await;
            store.clear();
            for (key, value) in data {
                store.set(key, &value)?;
            }
        }

        let SnapshotRecord {
            enabled,
            code,
            manifest,
            auto_update,
        } = entry.record;

        let registry = self.registry();
        if registry.contains(id) {
            let patch = RecordPatch {
                manifest: Some(manifest),
                code: Some(code),
                enabled: Some(enabled),
                auto_update,
                source: origin.source().map(str::to_string),
                ui_integration: None,
            };
            registry.edit(id, patch, true)?;
        } else {
            let mut record = PluginRecord::new(id, origin);
            record.manifest = manifest;
            record.code = code;
            record.enabled = enabled;
            record.last_updated = Some(Utc::now());
            registry.put(&record)?;
        }

        if enabled {
            self.start(id).await?;
        }
        Ok(())
    }
}

impl ImportReport {
    fn push(&mut self, plugin: String, result: Result<(), PluginError>) {
        match result {
            Ok(()) => self.imported.push(plugin),
            Err(e) => {
                tracing::error!(plugin = %plugin, "failed to import plugin: {e}");
                self.failures.push(ImportFailure {
                    plugin,
                    error: e.to_string(),
                });
            }
        }
    }
}
