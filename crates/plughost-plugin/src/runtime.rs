//! Lifecycle of installed plugins.
//!
//! The `Runtime` is the service object the host constructs once at startup.
//! It owns the registry, the private plugin stores and the set of currently
//! loaded plugins, and drives each plugin through
//! `Disabled → Starting → Running → Stopping → Disabled`.
//!
//! Start and stop are not reentrant per plugin: a slot is claimed for the id
//! before any await point, so a second call while one is in flight fails
//! fast. Different plugins never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use plughost_store::{Store, StoreBackend, StoreHub};
use serde::Serialize;
use serde_json::Value;

use crate::error::PluginError;
use crate::fetch::SourceFetcher;
use crate::host::Host;
use crate::loader::{PluginHooks, PluginLoader};
use crate::manifest::PluginManifest;
use crate::record::{NewLocalPlugin, PluginOrigin, PluginRecord, RecordPatch};
use crate::registry::{PluginRegistry, DEV_PLUGIN_ID};
use crate::sandbox::{Sandbox, SandboxConfig};

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Host version checked against manifest compatibility ranges.
    pub host_version: String,
    /// Store database for the registry and global config.
    pub database: String,
    /// Store database for private plugin stores.
    pub plugin_database: String,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            database: "plughost".to_string(),
            plugin_database: "plughost-plugins".to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host_version: std::env::var("PLUGHOST_VERSION").unwrap_or(defaults.host_version),
            database: std::env::var("PLUGHOST_DATABASE").unwrap_or(defaults.database),
            plugin_database: std::env::var("PLUGHOST_PLUGIN_DATABASE")
                .unwrap_or(defaults.plugin_database),
            sandbox: SandboxConfig::from_env(),
        }
    }
}

// ─── Loaded plugins ─────────────────────────────────────────────────────

/// An executing plugin: its hooks and everything allocated for it.
struct LoadedPlugin {
    hooks: Box<dyn PluginHooks>,
    sandbox: Sandbox,
}

/// A plugin stays `Starting` until `on_load` has finished, so only the
/// start that claimed the slot can unload it in the meantime.
enum Slot {
    Starting(Option<Arc<LoadedPlugin>>),
    Running(Arc<LoadedPlugin>),
    Stopping,
}

/// Where a plugin currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Disabled,
    Starting,
    Running,
    Stopping,
}

/// Name of the private store of plugin `id`.
pub fn plugin_store_name(id: &str) -> String {
    format!("plugin-{id}")
}

/// Open plugin `id`'s private store in `plugin_hub`.
///
/// Private stores may only be created once the registry store in
/// `registry_hub` has begun connecting.
fn open_plugin_store(
    registry_hub: &StoreHub,
    plugin_hub: &StoreHub,
    id: &str,
) -> Result<Store, PluginError> {
    if !registry_hub.connection_started() {
        return Err(PluginError::PrematureStoreAccess(id.to_string()));
    }
    Ok(plugin_hub.open(&plugin_store_name(id)))
}

// ─── Runtime ────────────────────────────────────────────────────────────

pub(crate) struct RuntimeInner {
    pub(crate) registry: PluginRegistry,
    hub: StoreHub,
    plugin_hub: StoreHub,
    loader: Arc<dyn PluginLoader>,
    fetcher: Arc<dyn SourceFetcher>,
    host: Arc<dyn Host>,
    sandbox_config: SandboxConfig,
    http: reqwest::Client,
    slots: Mutex<HashMap<String, Slot>>,
}

/// The plugin runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("database", &self.inner.hub.database())
            .field("loaded", &self.loaded_ids())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create the runtime and begin connecting its stores.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: RuntimeConfig,
        backend: Arc<dyn StoreBackend>,
        loader: Arc<dyn PluginLoader>,
        fetcher: Arc<dyn SourceFetcher>,
        host: Arc<dyn Host>,
    ) -> Self {
        let hub = StoreHub::new(config.database, backend.clone());
        let plugin_hub = StoreHub::new(config.plugin_database, backend);
        let registry = PluginRegistry::new(&hub);
        let http = config.sandbox.http_client();

        Self {
            inner: Arc::new(RuntimeInner {
                registry,
                hub,
                plugin_hub,
                loader,
                fetcher,
                host,
                sandbox_config: config.sandbox,
                http,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// The host-wide settings store.
    pub fn config(&self) -> &Store {
        self.inner.registry.config()
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    /// The private store of plugin `id`.
    pub fn plugin_store(&self, id: &str) -> Result<Store, PluginError> {
        open_plugin_store(&self.inner.hub, &self.inner.plugin_hub, id)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self, id: &str) -> PluginState {
        match self.inner.slots.lock().get(id) {
            None => PluginState::Disabled,
            Some(Slot::Starting(_)) => PluginState::Starting,
            Some(Slot::Running(_)) => PluginState::Running,
            Some(Slot::Stopping) => PluginState::Stopping,
        }
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded(id).is_some()
    }

    /// Ids of every running plugin.
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn loaded(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        match self.inner.slots.lock().get(id) {
            Some(Slot::Running(loaded)) => Some(loaded.clone()),
            _ => None,
        }
    }

    /// Update a record, logging instead of failing. Used for bookkeeping
    /// that must not mask the outcome of the operation itself.
    fn record_update<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut PluginRecord),
    {
        if let Err(e) = self.inner.registry.update(id, f) {
            tracing::warn!(plugin = %id, "failed to update plugin record: {e}");
        }
    }

    fn record_failure(&self, id: &str, error: &PluginError) {
        let now = Utc::now();
        self.record_update(id, |r| {
            r.note_error(error);
            r.enabled = false;
            r.disabled_at = Some(now);
        });
    }

    // ── Start / stop ─────────────────────────────────────────────────

    /// Evaluate a plugin's code and run its `on_load` hook.
    pub async fn start(&self, id: &str) -> Result<(), PluginError> {
        let record = self.inner.registry.get(id)?;
        {
            let mut slots = self.inner.slots.lock();
            if slots.contains_key(id) {
                return Err(PluginError::AlreadyLoaded(id.to_string()));
            }
            slots.insert(id.to_string(), Slot::Starting(None));
        }

        let result = self.launch(record).await;
        if result.is_err() {
            let mut slots = self.inner.slots.lock();
            if matches!(slots.get(id), Some(Slot::Starting(_))) {
                slots.remove(id);
            }
        }
        result
    }

    async fn launch(&self, record: PluginRecord) -> Result<(), PluginError> {
        let id = record.id.clone();

        if let Err(e) = record.manifest.validate(self.inner.host.version()) {
            tracing::warn!(plugin = %id, "plugin failed validation: {e}");
            self.record_failure(&id, &e);
            return Err(e);
        }

        let store = self.plugin_store(&id)?;
        store.ready().await;

        let sandbox = Sandbox::new(
            id.clone(),
            self.inner.sandbox_config.clone(),
            self.inner.http.clone(),
            store,
            self.inner.host.clone(),
        );

        let hooks = match self.inner.loader.load(&record, sandbox.context()).await {
            Ok(hooks) => hooks,
            Err(e) => {
                sandbox.dispose();
                let e = match e {
                    e @ PluginError::Evaluation { .. } => e,
                    other => PluginError::Evaluation {
                        id: id.clone(),
                        message: other.to_string(),
                    },
                };
                tracing::error!(plugin = %id, "plugin evaluation failed: {e}");
                self.record_failure(&id, &e);
                return Err(e);
            }
        };

        let loaded = Arc::new(LoadedPlugin { hooks, sandbox });
        self.inner
            .slots
            .lock()
            .insert(id.clone(), Slot::Starting(Some(loaded.clone())));

        if let Err(e) = loaded.hooks.on_load().await {
            tracing::error!(plugin = %id, "plugin on_load failed: {e}");
            self.record_failure(&id, &e);
            self.teardown(&id, &loaded).await;
            return Err(e);
        }

        let owned = {
            let mut slots = self.inner.slots.lock();
            let owned = matches!(
                slots.get(&id),
                Some(Slot::Starting(Some(current))) if Arc::ptr_eq(current, &loaded)
            );
            if owned {
                slots.insert(id.clone(), Slot::Running(loaded.clone()));
            }
            owned
        };
        if !owned {
            tracing::warn!(plugin = %id, "plugin slot was taken while starting");
            self.teardown(&id, &loaded).await;
            return Err(PluginError::NotLoaded(id));
        }

        let now = Utc::now();
        self.record_update(&id, |r| {
            r.enabled_at = Some(now);
            r.usage_stats.start_count += 1;
            r.usage_stats.last_started = Some(now);
        });
        tracing::info!(
            plugin = %id,
            version = %record.manifest.version,
            "plugin started"
        );
        Ok(())
    }

    /// Undo a start that never reached `Running`.
    async fn teardown(&self, id: &str, loaded: &LoadedPlugin) {
        if let Err(e) = loaded.hooks.on_unload().await {
            tracing::warn!(plugin = %id, "on_unload after failed start: {e}");
        }
        loaded.sandbox.dispose();
    }

    /// Run `on_unload`, release the sandbox and mark the plugin disabled.
    pub async fn stop(&self, id: &str) -> Result<(), PluginError> {
        self.inner.registry.get(id)?;
        self.unload(id, true).await
    }

    async fn unload(&self, id: &str, persist_disabled: bool) -> Result<(), PluginError> {
        let loaded = {
            let mut slots = self.inner.slots.lock();
            let loaded = match slots.get(id) {
                Some(Slot::Running(loaded)) => loaded.clone(),
                _ => return Err(PluginError::NotLoaded(id.to_string())),
            };
            slots.insert(id.to_string(), Slot::Stopping);
            loaded
        };

        if let Err(e) = loaded.hooks.on_unload().await {
            tracing::warn!(plugin = %id, "on_unload failed: {e}");
        }
        loaded.sandbox.dispose();

        let now = Utc::now();
        self.record_update(id, |r| {
            if let Some(enabled_at) = r.enabled_at {
                let ms = (now - enabled_at).num_milliseconds().max(0) as u64;
                r.usage_stats.total_uptime_ms =
                    Some(r.usage_stats.total_uptime_ms.unwrap_or(0) + ms);
            }
            r.disabled_at = Some(now);
            if persist_disabled {
                r.enabled = false;
            }
        });

        self.inner.slots.lock().remove(id);
        tracing::info!(plugin = %id, "plugin stopped");
        Ok(())
    }

    /// Persist `enabled = true` and start the plugin.
    pub async fn enable(&self, id: &str) -> Result<(), PluginError> {
        self.inner.registry.update(id, |r| r.enabled = true)?;
        self.start(id).await
    }

    /// Stop the plugin if it runs and persist `enabled = false`.
    pub async fn disable(&self, id: &str) -> Result<(), PluginError> {
        if self.is_loaded(id) {
            self.stop(id).await
        } else {
            self.inner.registry.update(id, |r| r.enabled = false)?;
            Ok(())
        }
    }

    // ── Install / update / remove ────────────────────────────────────

    pub fn install_local(
        &self,
        id: &str,
        plugin: NewLocalPlugin,
    ) -> Result<PluginRecord, PluginError> {
        self.inner.registry.install_local(id, plugin)
    }

    /// Register a remote plugin and fetch it.
    ///
    /// If the initial fetch fails the record is removed again.
    pub async fn install_remote(
        &self,
        id: &str,
        source: &str,
        auto_update: bool,
    ) -> Result<PluginRecord, PluginError> {
        self.inner.registry.insert_remote(id, source, auto_update)?;
        if let Err(e) = self.check_update(id).await {
            if let Err(rollback) = self.inner.registry.delete(id) {
                tracing::error!(plugin = %id, "failed to roll back remote install: {rollback}");
            }
            return Err(e);
        }
        tracing::info!(plugin = %id, source = %source, "remote plugin installed");
        self.inner.registry.get(id)
    }

    /// Fetch the remote manifest and, if it changed, the code.
    ///
    /// Returns whether an update was applied.
    pub async fn check_update(&self, id: &str) -> Result<bool, PluginError> {
        let record = self.inner.registry.get(id)?;
        let source = match &record.origin {
            PluginOrigin::Local => return Err(PluginError::CannotUpdateLocal(id.to_string())),
            PluginOrigin::Remote { source, .. } if source.trim().is_empty() => {
                return Err(PluginError::MissingSource(id.to_string()))
            }
            PluginOrigin::Remote { source, .. } => source.clone(),
        };

        let fetched = match self.fetch_update(&record, &source).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(plugin = %id, source = %source, "update check failed: {e}");
                self.record_update(id, |r| r.note_error(&e));
                return Err(PluginError::update_check(id, e));
            }
        };

        let Some((manifest, code)) = fetched else {
            tracing::debug!(plugin = %id, "plugin is up to date");
            return Ok(false);
        };

        self.inner.registry.edit(
            id,
            RecordPatch {
                manifest: Some(manifest.clone()),
                code: Some(code),
                ..Default::default()
            },
            true,
        )?;
        tracing::info!(plugin = %id, version = %manifest.version, "plugin updated");

        if let Some(loaded) = self.loaded(id) {
            if let Err(e) = loaded.hooks.on_update().await {
                tracing::warn!(plugin = %id, "on_update failed: {e}");
            }
            let now = Utc::now();
            self.record_update(id, |r| {
                r.usage_stats.start_count += 1;
                r.usage_stats.last_started = Some(now);
            });
        }

        self.inner.host.notify_update(id, &manifest);
        Ok(true)
    }

    async fn fetch_update(
        &self,
        record: &PluginRecord,
        source: &str,
    ) -> Result<Option<(PluginManifest, String)>, PluginError> {
        let manifest = self.inner.fetcher.fetch_manifest(source).await?;
        let stored = record.manifest.content_hash.as_deref();
        if stored.is_some() && manifest.content_hash.as_deref() == stored {
            return Ok(None);
        }
        let code = self.inner.fetcher.fetch_code(source).await?;
        Ok(Some((manifest, code)))
    }

    /// Stop the plugin if it runs, then delete its record.
    ///
    /// The development plugin's private store is cleared as well.
    pub async fn remove(&self, id: &str) -> Result<(), PluginError> {
        self.inner.registry.get(id)?;
        if self.is_loaded(id) {
            self.unload(id, true).await?;
        }
        self.inner.registry.delete(id)?;
        if id == DEV_PLUGIN_ID {
            self.plugin_store(id)?.clear();
        }
        tracing::info!(plugin = %id, "plugin removed");
        Ok(())
    }

    /// Install or replace the development plugin and start it.
    pub async fn activate_dev(
        &self,
        manifest: PluginManifest,
        code: impl Into<String>,
    ) -> Result<(), PluginError> {
        self.inner.registry.ready().await;
        if self.is_loaded(DEV_PLUGIN_ID) {
            self.unload(DEV_PLUGIN_ID, false).await?;
        }

        let mut record = self
            .inner
            .registry
            .get(DEV_PLUGIN_ID)
            .unwrap_or_else(|_| PluginRecord::new(DEV_PLUGIN_ID, PluginOrigin::Local));
        record.manifest = manifest;
        record.code = code.into();
        record.enabled = true;
        record.last_updated = Some(Utc::now());
        self.inner.registry.put(&record)?;

        self.start(DEV_PLUGIN_ID).await
    }

    // ── Hooks ────────────────────────────────────────────────────────

    /// Deliver new settings to a running plugin. Hook failures are logged.
    pub async fn settings_changed(&self, id: &str, settings: &Value) -> Result<(), PluginError> {
        let loaded = self
            .loaded(id)
            .ok_or_else(|| PluginError::NotLoaded(id.to_string()))?;
        if let Err(e) = loaded.hooks.on_settings_change(settings).await {
            tracing::warn!(plugin = %id, "on_settings_change failed: {e}");
        }
        Ok(())
    }

    /// Ask the host to display a running plugin's settings view.
    ///
    /// Returns whether the plugin has one.
    pub fn open_settings(&self, id: &str) -> Result<bool, PluginError> {
        let loaded = self
            .loaded(id)
            .ok_or_else(|| PluginError::NotLoaded(id.to_string()))?;
        match loaded.hooks.settings_view() {
            Some(view) => {
                self.inner.host.show_settings(id, &view);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Startup / shutdown ───────────────────────────────────────────

    /// Bring the runtime up.
    ///
    /// Waits for the stores, migrates legacy records, checks every
    /// auto-updating remote plugin concurrently and then starts every
    /// enabled plugin in registration order. Individual failures are
    /// logged and never abort the rest.
    pub async fn start_all(&self) -> Result<StopAll, PluginError> {
        let registry = &self.inner.registry;
        registry.ready().await;

        let migrated = registry.migrate_legacy_records()?;
        if migrated > 0 {
            tracing::info!(count = migrated, "migrated legacy plugin records");
        }

        let records = registry.list();
        let stores = records
            .iter()
            .map(|r| self.plugin_store(&r.id))
            .collect::<Result<Vec<_>, _>>()?;
        futures::future::join_all(stores.iter().map(|s| s.ready())).await;

        let updates = records
            .iter()
            .filter(|r| r.origin.auto_update())
            .map(|r| async move { (r.id.as_str(), self.check_update(&r.id).await) });
        for (id, result) in futures::future::join_all(updates).await {
            if let Err(e) = result {
                tracing::warn!(plugin = %id, "auto-update failed: {e}");
            }
        }

        let mut started = 0;
        for record in registry.list() {
            if !record.enabled || record.id == DEV_PLUGIN_ID {
                continue;
            }
            match self.start(&record.id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(plugin = %record.id, "failed to start plugin: {e}"),
            }
        }
        tracing::info!(started, total = records.len(), "plugin runtime started");

        Ok(StopAll {
            runtime: self.clone(),
        })
    }
}

/// Handle returned by [`Runtime::start_all`].
#[derive(Debug, Clone)]
pub struct StopAll {
    runtime: Runtime,
}

impl StopAll {
    /// Stop every running plugin, keeping each one's `enabled` intent so it
    /// starts again next time.
    pub async fn stop_all(&self) {
        for id in self.runtime.loaded_ids() {
            if let Err(e) = self.runtime.unload(&id, false).await {
                tracing::warn!(plugin = %id, "failed to stop plugin: {e}");
            }
        }
        self.runtime.registry().flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.database, "plughost");
        assert_eq!(config.plugin_database, "plughost-plugins");
        assert_eq!(config.host_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_plugin_store_name() {
        assert_eq!(plugin_store_name("clock"), "plugin-clock");
    }

    #[tokio::test]
    async fn test_plugin_store_requires_connecting_registry() {
        let backend: Arc<dyn StoreBackend> = Arc::new(plughost_store::MemoryBackend::new());
        let hub = StoreHub::new("db", backend.clone());
        let plugin_hub = StoreHub::new("plugins", backend);

        let err = open_plugin_store(&hub, &plugin_hub, "clock").unwrap_err();
        assert!(matches!(err, PluginError::PrematureStoreAccess(ref id) if id == "clock"));
        assert!(plugin_hub.names().is_empty());

        hub.open("registry");
        let store = open_plugin_store(&hub, &plugin_hub, "clock").unwrap();
        assert_eq!(store.name(), "plugin-clock");
        assert_eq!(plugin_hub.names(), vec!["plugin-clock".to_string()]);
    }

    #[test]
    fn test_plugin_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(PluginState::Running).unwrap(),
            serde_json::json!("running")
        );
    }
}
