//! Scripted collaborators for driving the runtime end to end.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plughost_plugin::{
    Host, PluginError, PluginHooks, PluginLoader, PluginManifest, PluginRecord, Runtime,
    RuntimeConfig, SandboxContext, SourceFetcher,
};
use plughost_store::MemoryBackend;
use serde_json::Value;
use tokio::sync::Notify;

pub const HOST_VERSION: &str = "1.0.0";

/// Ordered log of hook invocations, e.g. `"load:clock"`.
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn manifest(name: &str, version: &str) -> PluginManifest {
    PluginManifest {
        name: name.into(),
        description: format!("{name} plugin"),
        version: version.into(),
        author: "tests".into(),
        ..Default::default()
    }
}

// ─── Loader ─────────────────────────────────────────────────────────────

/// Loads plugins whose behavior is chosen by their `code`:
/// `"fail-eval"` fails evaluation, `"fail-load"` fails `on_load`,
/// `"with-settings"` exposes a settings view. `"gated"` and `"gated-fail"`
/// hold `on_load` until `gate` is notified, then succeed or fail.
/// Anything else loads cleanly.
#[derive(Default)]
pub struct ScriptedLoader {
    pub events: Events,
    pub gate: Arc<Notify>,
}

#[async_trait]
impl PluginLoader for ScriptedLoader {
    async fn load(
        &self,
        record: &PluginRecord,
        context: SandboxContext,
    ) -> Result<Box<dyn PluginHooks>, PluginError> {
        if record.code == "fail-eval" {
            return Err(PluginError::Hook("syntax error".into()));
        }
        Ok(Box::new(ScriptedHooks {
            id: record.id.clone(),
            code: record.code.clone(),
            context,
            events: self.events.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct ScriptedHooks {
    id: String,
    code: String,
    context: SandboxContext,
    events: Events,
    gate: Arc<Notify>,
}

impl ScriptedHooks {
    fn event(&self, name: &str) {
        self.events.lock().push(format!("{name}:{}", self.id));
    }
}

#[async_trait]
impl PluginHooks for ScriptedHooks {
    async fn on_load(&self) -> Result<(), PluginError> {
        self.event("load");
        if self.code.starts_with("gated") {
            self.gate.notified().await;
        }
        if self.code == "fail-load" || self.code == "gated-fail" {
            return Err(PluginError::Hook("boom".into()));
        }
        let store = self.context.store()?;
        let loads = store.get_as::<u64>("loads")?.unwrap_or(0);
        store.set("loads", &(loads + 1))?;
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), PluginError> {
        self.event("unload");
        Ok(())
    }

    async fn on_update(&self) -> Result<(), PluginError> {
        self.event("update");
        Ok(())
    }

    async fn on_settings_change(&self, settings: &Value) -> Result<(), PluginError> {
        self.event("settings");
        self.context.store()?.set("settings", settings)?;
        Ok(())
    }

    fn settings_view(&self) -> Option<Value> {
        (self.code == "with-settings").then(|| serde_json::json!({"fields": ["interval"]}))
    }
}

// ─── Fetcher ────────────────────────────────────────────────────────────

/// Serves remote plugins from memory. Unknown sources are unreachable.
#[derive(Default)]
pub struct ScriptedFetcher {
    sources: Mutex<HashMap<String, (PluginManifest, String)>>,
    unreachable: Mutex<HashSet<String>>,
    pub code_fetches: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn publish(&self, source: &str, manifest: PluginManifest, code: &str) {
        self.sources
            .lock()
            .insert(source.to_string(), (manifest, code.to_string()));
    }

    pub fn take_down(&self, source: &str) {
        self.unreachable.lock().insert(source.to_string());
    }

    fn lookup(&self, source: &str) -> Result<(PluginManifest, String), PluginError> {
        if self.unreachable.lock().contains(source) {
            return Err(PluginError::Http(format!("GET {source}/manifest failed")));
        }
        self.sources
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| PluginError::Http(format!("GET {source}/manifest returned 404")))
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch_manifest(&self, source: &str) -> Result<PluginManifest, PluginError> {
        Ok(self.lookup(source)?.0)
    }

    async fn fetch_code(&self, source: &str) -> Result<String, PluginError> {
        self.code_fetches.lock().push(source.to_string());
        Ok(self.lookup(source)?.1)
    }
}

// ─── Host ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingHost {
    pub notified: Mutex<Vec<(String, String)>>,
    pub settings_shown: Mutex<Vec<(String, Value)>>,
}

impl Host for RecordingHost {
    fn version(&self) -> &str {
        HOST_VERSION
    }

    fn notify_update(&self, id: &str, manifest: &PluginManifest) {
        self.notified
            .lock()
            .push((id.to_string(), manifest.version.clone()));
    }

    fn show_settings(&self, id: &str, view: &Value) {
        self.settings_shown
            .lock()
            .push((id.to_string(), view.clone()));
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

pub struct Harness {
    pub runtime: Runtime,
    pub backend: Arc<MemoryBackend>,
    pub events: Events,
    /// Releases plugins installed with `"gated"` code.
    pub gate: Arc<Notify>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub host: Arc<RecordingHost>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), Arc::new(ScriptedFetcher::default()))
    }

    /// A runtime over existing storage, as after a restart.
    pub fn with_backend(backend: Arc<MemoryBackend>, fetcher: Arc<ScriptedFetcher>) -> Self {
        let loader = ScriptedLoader::default();
        let events = loader.events.clone();
        let gate = loader.gate.clone();
        let host = Arc::new(RecordingHost::default());
        let runtime = Runtime::new(
            RuntimeConfig::default(),
            backend.clone(),
            Arc::new(loader),
            fetcher.clone(),
            host.clone(),
        );
        Self {
            runtime,
            backend,
            events,
            gate,
            fetcher,
            host,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Install a disabled local plugin.
    pub async fn install(&self, id: &str, code: &str) {
        self.runtime.registry().ready().await;
        self.runtime
            .install_local(
                id,
                plughost_plugin::NewLocalPlugin::new(manifest(id, "1.0.0"), code),
            )
            .unwrap();
    }
}
