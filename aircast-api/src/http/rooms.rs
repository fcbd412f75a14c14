// Room management HTTP handlers

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use aircast_core::models::{LiveMeta, RoomId, RoomMeta};

use super::{AppResult, AppState};
use crate::service::CreateRoomRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomBody {
    pub room_id: Option<String>,
    pub pin: Option<String>,
    pub max_anchors: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub room_id: String,
    pub pin: String,
    pub hls_path: String,
    pub max_anchors: u32,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveResponse {
    pub status: String,
    pub mixer_id: String,
    pub janus_id: String,
    pub created_at: String,
}

fn room_response(room_id: &RoomId, meta: RoomMeta, live: Option<LiveMeta>) -> RoomResponse {
    RoomResponse {
        room_id: room_id.to_string(),
        pin: meta.pin,
        hls_path: meta.hls_path,
        max_anchors: meta.max_anchors,
        created_at: meta.created_at.to_rfc3339(),
        live: live.map(|l| LiveResponse {
            status: match l.status {
                aircast_core::models::LiveStatus::Onair => "onair".to_string(),
                aircast_core::models::LiveStatus::Removing => "removing".to_string(),
            },
            mixer_id: l.mixer_id.to_string(),
            janus_id: l.janus_id.to_string(),
            created_at: l.created_at.to_rfc3339(),
        }),
    }
}

/// Create a room; missing fields are generated.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> AppResult<Json<RoomResponse>> {
    let (room_id, meta) = state
        .room_service
        .create_room(CreateRoomRequest {
            room_id: body.room_id,
            pin: body.pin,
            max_anchors: body.max_anchors,
        })
        .await?;
    Ok(Json(room_response(&room_id, meta, None)))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomResponse>> {
    let room_id = RoomId::from_string(room_id);
    let (meta, live) = state.room_service.get_room(&room_id).await?;
    Ok(Json(room_response(&room_id, meta, live)))
}

pub async fn list_rooms(State(state): State<AppState>) -> AppResult<Json<Vec<RoomResponse>>> {
    let rooms = state.room_service.list_rooms().await?;
    Ok(Json(
        rooms
            .into_iter()
            .map(|(room_id, meta)| room_response(&room_id, meta, None))
            .collect(),
    ))
}

pub async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .room_service
        .delete_room(&RoomId::from_string(room_id))
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Start the room's broadcast: workers are picked and live metadata lands
/// in the store for the mixers to converge on.
pub async fn start_live(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<LiveResponse>> {
    let live = state
        .room_service
        .start_broadcast(&RoomId::from_string(room_id))
        .await?;
    Ok(Json(LiveResponse {
        status: "onair".to_string(),
        mixer_id: live.mixer_id.to_string(),
        janus_id: live.janus_id.to_string(),
        created_at: live.created_at.to_rfc3339(),
    }))
}

pub async fn stop_live(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .room_service
        .stop_broadcast(&RoomId::from_string(room_id))
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
