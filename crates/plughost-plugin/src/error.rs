//! Plugin runtime error types.

use plughost_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("plugin already exists: {0}")]
    DuplicateId(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("invalid plugin id '{0}': only lowercase letters, digits and '-' are allowed")]
    InvalidId(String),

    #[error("invalid plugin record: {0}")]
    InvalidRecord(String),

    #[error("plugin {0} is local and cannot be updated")]
    CannotUpdateLocal(String),

    #[error("plugin {0} has no source to update from")]
    MissingSource(String),

    #[error("store for plugin {0} requested before the registry store began connecting")]
    PrematureStoreAccess(String),

    #[error("failed to evaluate plugin {id}: {message}")]
    Evaluation { id: String, message: String },

    #[error("update check failed for plugin {id}: {source}")]
    UpdateCheck {
        id: String,
        #[source]
        source: Box<PluginError>,
    },

    #[error("rate limit exceeded: plugin {id} used its {capability} quota")]
    RateLimitExceeded { id: String, capability: &'static str },

    #[error("plugin hook failed: {0}")]
    Hook(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    pub(crate) fn update_check(id: &str, cause: PluginError) -> Self {
        PluginError::UpdateCheck {
            id: id.to_string(),
            source: Box::new(cause),
        }
    }
}
