//! The host application as seen by the runtime.

use serde_json::Value;

use crate::manifest::PluginManifest;

/// Affordances the embedding application offers to plugins.
pub trait Host: Send + Sync + 'static {
    /// Host version, checked against manifest compatibility ranges.
    fn version(&self) -> &str;

    /// Tell the user that a plugin was updated.
    fn notify_update(&self, id: &str, manifest: &PluginManifest);

    /// Display a plugin's settings view.
    fn show_settings(&self, id: &str, view: &Value);
}

/// A host with no user interface; notifications are only logged.
#[derive(Debug, Clone)]
pub struct NullHost {
    version: String,
}

impl NullHost {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Host for NullHost {
    fn version(&self) -> &str {
        &self.version
    }

    fn notify_update(&self, id: &str, manifest: &PluginManifest) {
        tracing::info!(plugin = %id, version = %manifest.version, "plugin updated");
    }

    fn show_settings(&self, id: &str, _view: &Value) {
        tracing::debug!(plugin = %id, "settings view requested but host has no UI");
    }
}
