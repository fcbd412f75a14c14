// Room user HTTP handlers
//
// These proxy to the status controller over the bus; the API mints the
// identity and its scope token, the controller owns the membership state.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use aircast_core::models::{RoomId, UserId};
use aircast_core::validation::validate_room_id;

use super::{AppError, AppResult, AppState};

/// Timeout for status-controller calls.
const STATUS_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub token: String,
}

/// `POST /api/rooms/:roomId/users`
pub async fn create_user(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(body): Json<CreateUserBody>,
) -> AppResult<Json<CreateUserResponse>> {
    validate_room_id(&room_id).map_err(AppError::from)?;
    if let Some(role) = &body.role {
        if !matches!(role.as_str(), "host" | "anchor" | "guest") {
            return Err(AppError::bad_request(format!("Unknown role: {role}")));
        }
    }

    let user_id = UserId::generate();
    state
        .status_peer
        .call(
            "createUser",
            serde_json::json!({
                "roomId": room_id,
                "userId": user_id.as_str(),
                "role": body.role,
            }),
            STATUS_CALL_TIMEOUT,
        )
        .await?;

    let token = state
        .tokens
        .sign(&user_id, &RoomId::from_string(room_id))?;
    Ok(Json(CreateUserResponse {
        user_id: user_id.to_string(),
        token,
    }))
}

/// `DELETE /api/rooms/:roomId/users/:userId`
pub async fn delete_user(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    validate_room_id(&room_id).map_err(AppError::from)?;
    state
        .status_peer
        .call(
            "deleteUser",
            serde_json::json!({ "roomId": room_id, "userId": user_id }),
            STATUS_CALL_TIMEOUT,
        )
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
