//! The trust boundary: turning plugin code into lifecycle hooks.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PluginError;
use crate::record::PluginRecord;
use crate::sandbox::SandboxContext;

/// Lifecycle hooks of an evaluated plugin. Every hook is optional.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn on_load(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_update(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_settings_change(&self, _settings: &Value) -> Result<(), PluginError> {
        Ok(())
    }

    /// Settings UI description, if the plugin has one.
    fn settings_view(&self) -> Option<Value> {
        None
    }
}

/// Evaluates a record's code against a fixed capability object.
///
/// This is the only place plugin code is turned into something runnable.
#[async_trait]
pub trait PluginLoader: Send + Sync + 'static {
    async fn load(
        &self,
        record: &PluginRecord,
        context: SandboxContext,
    ) -> Result<Box<dyn PluginHooks>, PluginError>;
}
