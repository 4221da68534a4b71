//! Export / import endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use indexmap::IndexMap;
use plughost_plugin::{verify, ImportReport, Snapshot};
use serde::Deserialize;

use super::{error_response, ApiError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    /// Plugin id → whether to include its private store.
    #[serde(default)]
    pub plugins: IndexMap<String, bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/export
pub async fn export(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExportRequest>,
) -> Result<Json<Snapshot>, ApiError> {
    let snapshot = state
        .runtime
        .export(&body.plugins)
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

/// POST /api/import — Merge a snapshot into this instance.
///
/// Refuses to touch existing plugins unless `?force=true`.
pub async fn import(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImportQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ImportReport>, ApiError> {
    verify(&body).map_err(error_response)?;
    let snapshot = Snapshot::from_value(body).map_err(error_response)?;

    state.runtime.registry().ready().await;
    if !query.force && state.runtime.would_conflict(&snapshot) {
        return Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "snapshot overlaps installed plugins; retry with ?force=true to merge"
            })),
        ));
    }

    Ok(Json(state.runtime.import(snapshot).await))
}
