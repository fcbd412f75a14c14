//! Token minting and HLS content-key issuance.
//!
//! The key path answers with raw bytes and deliberately terse denial
//! messages: every auth failure is a 403 with a numbered "Access denied"
//! body, so probes learn nothing about which check tripped beyond the
//! coarse stage number.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use aircast_core::crypto::derive_content_key;
use aircast_core::models::{RoomId, UserId};
use aircast_core::validation::validate_room_id;

use super::middleware::extract_bearer;
use super::{AppResult, AppState};

/// `POST /api/token` request.
#[derive(Debug, Deserialize)]
pub struct MintTokenRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

#[derive(Debug, Serialize)]
pub struct MintTokenResponse {
    pub token: String,
}

/// Mint a room scope token for a fresh user identity.
pub async fn mint_token(
    State(state): State<AppState>,
    Json(req): Json<MintTokenRequest>,
) -> AppResult<Json<MintTokenResponse>> {
    validate_room_id(&req.room_id).map_err(super::AppError::from)?;

    let user_id = UserId::generate();
    let token = state
        .tokens
        .sign(&user_id, &RoomId::from_string(req.room_id))?;
    Ok(Json(MintTokenResponse { token }))
}

fn denied(stage: u8) -> Response {
    (StatusCode::FORBIDDEN, format!("Access denied {stage}")).into_response()
}

/// `GET /hls/rooms/:roomId/enc.key`
///
/// Serves the 16-byte AES-128 content key for the room's current
/// broadcast to a caller presenting a token scoped to that room.
pub async fn content_key(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if validate_room_id(&room_id).is_err() {
        return (StatusCode::BAD_REQUEST, "Invalid room id").into_response();
    }

    let claims = match extract_bearer(&headers)
        .map_err(str::to_string)
        .and_then(|token| state.tokens.verify(token).map_err(|e| e.to_string()))
    {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(room_id = %room_id, error = %e, "Content-key auth failed");
            return denied(1);
        }
    };

    // Scope check in constant time
    let matches: bool = claims
        .room_id
        .as_bytes()
        .ct_eq(room_id.as_bytes())
        .into();
    if !matches {
        tracing::debug!(
            room_id = %room_id,
            claim_room = %claims.room_id,
            "Token scoped to a different room"
        );
        return denied(2);
    }

    let room_id = RoomId::from_string(room_id);
    if let Some(key) = state.key_cache.get(&room_id) {
        return key_response(&key);
    }

    let Some(live) = state
        .rooms_watcher
        .get_cached(room_id.as_str())
        .and_then(|room| room.live)
    else {
        return denied(3);
    };
    if !matches!(live.status, aircast_core::models::LiveStatus::Onair) {
        return denied(3);
    }

    let key = derive_content_key(&room_id, &live.nonce);
    state.key_cache.insert(room_id, key);
    key_response(&key)
}

fn key_response(key: &[u8; 16]) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate",
            ),
        ],
        key.to_vec(),
    )
        .into_response()
}
