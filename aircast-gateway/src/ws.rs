//! WebSocket endpoint.
//!
//! Clients authenticate with a room scope token, claim their single
//! session slot, and speak JSON-RPC over the socket. Membership methods
//! are proxied to the status controller with the identity taken from the
//! token (never from the client payload); resume-token methods run
//! locally against the sealed codec.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use aircast_bus::{Envelope, Peer, RpcError};
use aircast_core::crypto::{ResumeTokenCodec, RoomTokenService};
use aircast_core::models::{generate_id, RoomId, UserId};

use crate::guard::SessionGuard;
use crate::hub::ClientHub;

/// Timeout for proxied status-controller calls.
const PROXY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GatewayState {
    pub hub: Arc<ClientHub>,
    pub guard: Arc<SessionGuard>,
    pub status_peer: Arc<Peer>,
    pub tokens: RoomTokenService,
    pub resume_codec: Option<ResumeTokenCodec>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/health",
            get(|| async { axum::Json(json!({"status": "ok"})) }),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "roomId")]
    room_id: String,
    token: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let claims = match state.tokens.verify(&query.token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket auth failed");
            return (axum::http::StatusCode::FORBIDDEN, "Access denied").into_response();
        }
    };
    if claims.room_id != query.room_id {
        return (axum::http::StatusCode::FORBIDDEN, "Access denied").into_response();
    }

    let room_id = RoomId::from_string(query.room_id);
    let user_id = UserId::from_string(claims.user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, user_id))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    room_id: RoomId,
    user_id: UserId,
) {
    let conn_id = generate_id();

    let lease = match state.guard.acquire(&user_id, &conn_id).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Session claim failed");
            return;
        }
    };

    let mut frames = state.hub.add_client(conn_id.clone(), room_id.clone(), user_id.clone());
    let (mut sink, mut stream) = socket.split();

    // Writer: drain the hub queue into the socket. The queue closing
    // means the hub dropped this connection (preemption or room removal).
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: handle client requests until the socket closes or the
    // writer ends (hub dropped the connection).
    let mut writer_done = false;
    while !writer_done {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &conn_id, &room_id, &user_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket read error");
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
            }
        }
    }

    if !writer_done {
        writer.abort();
    }
    state.hub.remove_client(&conn_id);
    state.guard.release(lease).await;
    tracing::info!(conn_id = %conn_id, user_id = %user_id, "WebSocket session ended");
}

async fn handle_frame(
    state: &Arc<GatewayState>,
    conn_id: &str,
    room_id: &RoomId,
    user_id: &UserId,
    text: &str,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Undecodable client frame");
            return;
        }
    };
    let Envelope::Request { id, method, params } = envelope else {
        return;
    };

    let result = dispatch(state, room_id, user_id, &method, params).await;
    let reply = match result {
        Ok(value) => Envelope::Response {
            id,
            result: Some(value),
            error: None,
        },
        Err(error) => Envelope::Response {
            id,
            result: None,
            error: Some(error),
        },
    };
    let Ok(frame) = serde_json::to_string(&reply) else {
        return;
    };
    if let Some(sender) = state.hub.sender(conn_id) {
        let _ = sender.send(frame).await;
    }
}

async fn dispatch(
    state: &Arc<GatewayState>,
    room_id: &RoomId,
    user_id: &UserId,
    method: &str,
    mut params: Value,
) -> Result<Value, RpcError> {
    match method {
        "createUser" | "deleteUser" | "setUserStatus" => {
            // Identity comes from the verified token, not the payload.
            if !params.is_object() {
                params = json!({});
            }
            if let Some(object) = params.as_object_mut() {
                object.insert("roomId".to_string(), json!(room_id.as_str()));
                object.insert("userId".to_string(), json!(user_id.as_str()));
            }
            state
                .status_peer
                .call(method, params, PROXY_TIMEOUT)
                .await
                .map_err(|e| match e {
                    aircast_bus::Error::Rpc { code, message } => RpcError { code, message },
                    other => RpcError::internal(other.to_string()),
                })
        }
        "mintResumeToken" => {
            let codec = resume_codec(state)?;
            let session_id = require_i64(&params, "sessionId")?;
            let handle_id = require_i64(&params, "handleId")?;
            let token = codec
                .encode(room_id.as_str(), session_id, handle_id)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "token": token }))
        }
        "resumeSession" => {
            let codec = resume_codec(state)?;
            let token = params
                .get("token")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("token is required"))?;
            let (session_id, handle_id) = codec
                .decode(room_id.as_str(), token)
                .map_err(|_| RpcError::invalid_request("invalid resume token"))?;
            Ok(json!({ "sessionId": session_id, "handleId": handle_id }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

fn resume_codec(state: &Arc<GatewayState>) -> Result<&ResumeTokenCodec, RpcError> {
    state
        .resume_codec
        .as_ref()
        .ok_or_else(|| RpcError::internal("Resume tokens not configured"))
}

fn require_i64(params: &Value, field: &str) -> Result<i64, RpcError> {
    params
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::invalid_params(format!("{field} is required")))
}
