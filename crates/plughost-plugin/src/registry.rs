//! CRUD over persisted plugin records.
//!
//! Records live in the `plugin-registry` store keyed by id. The registry
//! knows nothing about running plugins; the runtime layers lifecycle on top.

use std::sync::LazyLock;

use chrono::Utc;
use plughost_store::{Store, StoreHub};
use regex::Regex;

use crate::error::PluginError;
use crate::record::{NewLocalPlugin, PluginOrigin, PluginRecord, RecordPatch};

/// Store holding one record per plugin id.
pub const REGISTRY_STORE: &str = "plugin-registry";

/// Store holding host-wide settings.
pub const CONFIG_STORE: &str = "config";

/// Id reserved for the development-mode plugin.
pub const DEV_PLUGIN_ID: &str = "dev-plugin";

static REMOTE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("id pattern is valid"));

/// Whether `id` is acceptable for a remote plugin.
pub fn is_valid_remote_id(id: &str) -> bool {
    REMOTE_ID_RE.is_match(id)
}

/// Service object over the registry and config stores.
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    records: Store,
    config: Store,
}

impl PluginRegistry {
    /// Open the registry stores in `hub`.
    pub fn new(hub: &StoreHub) -> Self {
        Self {
            records: hub.open(REGISTRY_STORE),
            config: hub.open(CONFIG_STORE),
        }
    }

    /// The host-wide settings store.
    pub fn config(&self) -> &Store {
        &self.config
    }

    /// Wait until both stores are connected.
    pub async fn ready(&self) {
        self.records.ready().await;
        self.config.ready().await;
    }

    /// Wait until every prior write to both stores is durable.
    pub async fn flush(&self) {
        self.records.flush().await;
        self.config.flush().await;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// The record for `id`.
    pub fn get(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let value = self
            .records
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let (record, _) = PluginRecord::from_stored(value)?;
        Ok(record)
    }

    /// Every record in registration order.
    ///
    /// Records that fail to decode are skipped with a warning.
    pub fn list(&self) -> Vec<PluginRecord> {
        self.records
            .entries()
            .into_iter()
            .filter_map(|(id, value)| match PluginRecord::from_stored(value) {
                Ok((record, _)) => Some(record),
                Err(e) => {
                    tracing::warn!(plugin = %id, "skipping unreadable plugin record: {e}");
                    None
                }
            })
            .collect()
    }

    /// Remote records whose source is `source`, in registration order.
    pub fn find_by_source(&self, source: &str) -> Vec<PluginRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.origin.source() == Some(source))
            .collect()
    }

    /// Add a locally authored plugin.
    ///
    /// Local plugins start disabled and never carry host display hints.
    pub fn install_local(
        &self,
        id: &str,
        plugin: NewLocalPlugin,
    ) -> Result<PluginRecord, PluginError> {
        if id == DEV_PLUGIN_ID || self.contains(id) {
            return Err(PluginError::DuplicateId(id.to_string()));
        }

        let mut record = PluginRecord::new(id, PluginOrigin::Local);
        record.manifest = plugin.manifest;
        record.code = plugin.code;
        self.put(&record)?;

        tracing::info!(plugin = %id, "local plugin installed");
        Ok(record)
    }

    /// Add an empty remote record to be filled by an update check.
    pub fn insert_remote(
        &self,
        id: &str,
        source: &str,
        auto_update: bool,
    ) -> Result<PluginRecord, PluginError> {
        if self.contains(id) {
            return Err(PluginError::DuplicateId(id.to_string()));
        }
        if !is_valid_remote_id(id) {
            return Err(PluginError::InvalidId(id.to_string()));
        }

        let record = PluginRecord::new(
            id,
            PluginOrigin::Remote {
                source: source.to_string(),
                auto_update,
            },
        );
        self.put(&record)?;
        Ok(record)
    }

    /// Merge `patch` onto the record for `id`.
    pub fn edit(
        &self,
        id: &str,
        patch: RecordPatch,
        mark_updated: bool,
    ) -> Result<PluginRecord, PluginError> {
        self.update(id, |record| {
            patch.apply(record);
            if mark_updated {
                record.last_updated = Some(Utc::now());
            }
        })
    }

    /// Apply `f` to the record for `id` and persist the result.
    pub fn update<F>(&self, id: &str, f: F) -> Result<PluginRecord, PluginError>
    where
        F: FnOnce(&mut PluginRecord),
    {
        let mut record = self.get(id)?;
        f(&mut record);
        self.put(&record)?;
        Ok(record)
    }

    /// Insert or replace a record as is.
    pub fn put(&self, record: &PluginRecord) -> Result<(), PluginError> {
        self.records.set(record.id.clone(), record)?;
        Ok(())
    }

    /// Delete the record for `id`, returning it.
    pub fn delete(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let record = self.get(id)?;
        self.records.delete(id);
        Ok(record)
    }

    /// Rewrite records stored without an explicit origin tag.
    pub fn migrate_legacy_records(&self) -> Result<usize, PluginError> {
        let mut migrated = 0;
        for (id, value) in self.records.entries() {
            match PluginRecord::from_stored(value) {
                Ok((record, true)) => {
                    self.put(&record)?;
                    tracing::info!(
                        plugin = %id,
                        local = record.origin.is_local(),
                        "migrated legacy plugin record"
                    );
                    migrated += 1;
                }
                Ok((_, false)) => {}
                Err(e) => tracing::warn!(plugin = %id, "cannot migrate plugin record: {e}"),
            }
        }
        Ok(migrated)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
