//! Plugin management endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use plughost_plugin::{NewLocalPlugin, PluginError, PluginRecord, PluginState};
use serde::{Deserialize, Serialize};

use super::{error_response, ApiError};
use crate::AppState;

// ─── Request / Response types ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PluginView {
    #[serde(flatten)]
    pub record: PluginRecord,
    pub state: PluginState,
}

#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInstallRequest {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub auto_update: bool,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub updated: bool,
}

fn view(state: &AppState, record: PluginRecord) -> PluginView {
    PluginView {
        state: state.runtime.state(&record.id),
        record,
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET /api/plugins — List every installed plugin.
pub async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<PluginListResponse> {
    let registry = state.runtime.registry();
    registry.ready().await;
    let plugins = registry
        .list()
        .into_iter()
        .map(|record| view(&state, record))
        .collect();
    Json(PluginListResponse { plugins })
}

/// GET /api/plugins/{id}
pub async fn get_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PluginView>, ApiError> {
    let record = state.runtime.registry().get(&id).map_err(error_response)?;
    Ok(Json(view(&state, record)))
}

/// POST /api/plugins/local — Install a locally authored plugin (disabled).
pub async fn install_local(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<PluginView>), ApiError> {
    let id = body["id"]
        .as_str()
        .ok_or_else(|| error_response(PluginError::InvalidRecord("id must be a string".into())))?
        .to_string();
    let plugin = NewLocalPlugin::from_json(&body).map_err(error_response)?;

    state.runtime.registry().ready().await;
    let record = state
        .runtime
        .install_local(&id, plugin)
        .map_err(error_response)?;

    tracing::info!(plugin = %id, "local plugin installed via API");
    Ok((StatusCode::CREATED, Json(view(&state, record))))
}

/// POST /api/plugins/remote — Install a plugin from a remote source.
pub async fn install_remote(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RemoteInstallRequest>,
) -> Result<(StatusCode, Json<PluginView>), ApiError> {
    state.runtime.registry().ready().await;
    let record = state
        .runtime
        .install_remote(&body.id, &body.source, body.auto_update)
        .await
        .map_err(|e| {
            tracing::warn!(plugin = %body.id, source = %body.source, "remote install failed: {e}");
            error_response(e)
        })?;
    Ok((StatusCode::CREATED, Json(view(&state, record))))
}

/// POST /api/plugins/{id}/enable
pub async fn enable_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PluginView>, ApiError> {
    state.runtime.enable(&id).await.map_err(error_response)?;
    get_plugin(State(state), Path(id)).await
}

/// POST /api/plugins/{id}/disable
pub async fn disable_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PluginView>, ApiError> {
    state.runtime.disable(&id).await.map_err(error_response)?;
    get_plugin(State(state), Path(id)).await
}

/// POST /api/plugins/{id}/update — Check the plugin's source for an update.
pub async fn update_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let updated = state.runtime.check_update(&id).await.map_err(error_response)?;
    Ok(Json(UpdateResponse { updated }))
}

/// DELETE /api/plugins/{id}
pub async fn remove_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.runtime.remove(&id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
