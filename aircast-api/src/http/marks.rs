// Module mark HTTP handlers

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use aircast_core::models::{MarkLabel, ModuleId, ModuleKind};

use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SetMarkBody {
    pub label: String,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleResponse {
    pub module_id: String,
    pub healthy: bool,
    pub pickable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

fn parse_kind(kind: &str) -> Result<ModuleKind, AppError> {
    ModuleKind::from_str(kind).map_err(AppError::from)
}

/// `PUT /api/modules/:type/:id/mark`
pub async fn set_mark(
    State(state): State<AppState>,
    Path((kind, module_id)): Path<(String, String)>,
    Json(body): Json<SetMarkBody>,
) -> AppResult<Json<serde_json::Value>> {
    let kind = parse_kind(&kind)?;
    let label = MarkLabel::from_str(&body.label)?;
    state
        .module_service
        .set_mark(kind, &ModuleId::from_string(module_id), label, body.ttl.unwrap_or(0))
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `DELETE /api/modules/:type/:id/mark`
pub async fn clear_mark(
    State(state): State<AppState>,
    Path((kind, module_id)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let kind = parse_kind(&kind)?;
    state
        .module_service
        .clear_mark(kind, &ModuleId::from_string(module_id))
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `GET /api/modules/:type`
pub async fn list_modules(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<Vec<ModuleResponse>>> {
    let kind = parse_kind(&kind)?;
    let modules = state
        .module_service
        .list_modules(kind)
        .into_iter()
        .map(|(module_id, state)| ModuleResponse {
            module_id: module_id.to_string(),
            healthy: state.is_healthy(),
            pickable: state.is_pickable(),
            label: state.mark.map(|m| format!("{:?}", m.label).to_lowercase()),
            host: state.heartbeat.as_ref().map(|h| h.host.clone()),
            capacity: state.heartbeat.as_ref().map(|h| h.capacity),
        })
        .collect();
    Ok(Json(modules))
}
