pub mod plugins;
pub mod snapshot;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use plughost_plugin::PluginError;
use serde::Serialize;

use crate::AppState;

/// Error body returned by every handler.
pub type ApiError = (StatusCode, Json<serde_json::Value>);

/// Map a runtime error onto a status code and a JSON body.
pub fn error_response(e: PluginError) -> ApiError {
    let status = match &e {
        PluginError::NotFound(_) => StatusCode::NOT_FOUND,
        PluginError::DuplicateId(_) | PluginError::AlreadyLoaded(_) | PluginError::NotLoaded(_) => {
            StatusCode::CONFLICT
        }
        PluginError::Validation(_)
        | PluginError::InvalidId(_)
        | PluginError::InvalidRecord(_)
        | PluginError::CannotUpdateLocal(_)
        | PluginError::MissingSource(_)
        | PluginError::Snapshot(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("request failed: {e}");
    }
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    version: &'static str,
    loaded: usize,
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<ApiStatus> {
    Json(ApiStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        loaded: state.runtime.loaded_ids().len(),
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/plugins", get(plugins::list_plugins))
        .route("/plugins/local", post(plugins::install_local))
        .route("/plugins/remote", post(plugins::install_remote))
        .route(
            "/plugins/{id}",
            get(plugins::get_plugin).delete(plugins::remove_plugin),
        )
        .route("/plugins/{id}/enable", post(plugins::enable_plugin))
        .route("/plugins/{id}/disable", post(plugins::disable_plugin))
        .route("/plugins/{id}/update", post(plugins::update_plugin))
        .route("/export", post(snapshot::export))
        .route("/import", post(snapshot::import))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)); // snapshots carry plugin code

    Router::new().nest("/api", api).with_state(state)
}
