//! HTTP surface integration tests over in-process backends.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use sha2::Digest;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use aircast_api::ApiContext;
use aircast_bus::{MemoryBus, StreamBus};
use aircast_core::config::Config;
use aircast_core::kv::{KvStore, MemoryKv};
use aircast_core::models::module::{subkeys as module_subkeys, HeartbeatStatus, ModuleHeartbeat};
use aircast_core::models::room::{subkeys as room_subkeys, LiveMeta, LiveStatus};
use aircast_core::models::{KeyLayout, ModuleId, ModuleKind, RoomId};

struct TestStack {
    router: Router,
    context: ApiContext,
    kv: MemoryKv,
    layout: KeyLayout,
}

async fn stack() -> TestStack {
    let kv = MemoryKv::new();
    let bus = Arc::new(MemoryBus::new());
    let layout = KeyLayout::default();

    let mut config = Config::default();
    config.token.secret = "integration-test-secret".to_string();

    // A worker of each kind so broadcast starts can pick
    for (kind, id) in [(ModuleKind::Mixers, "m1"), (ModuleKind::Januses, "j1")] {
        let hb = ModuleHeartbeat {
            status: HeartbeatStatus::Healthy,
            host: "127.0.0.1".to_string(),
            capacity: 8,
            started_at: chrono::Utc::now(),
        };
        kv.put(
            &layout.module_subkey(kind, &ModuleId::from(id), module_subkeys::HEARTBEAT),
            serde_json::to_vec(&hb).unwrap(),
            None,
        )
        .await
        .unwrap();
    }

    let (router, context) = ApiContext::start(
        Arc::new(kv.clone()),
        bus.clone() as Arc<dyn StreamBus>,
        &config,
    )
    .await
    .unwrap();

    drop(bus);
    TestStack {
        router,
        context,
        kv,
        layout,
    }
}

async fn request(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn create_room(stack: &TestStack, room_id: &str) {
    let (status, _) = request(
        &stack.router,
        json_request("POST", "/api/rooms", serde_json::json!({ "roomId": room_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn put_live(stack: &TestStack, room_id: &str, nonce: &str, status: LiveStatus) {
    let live = LiveMeta {
        status,
        mixer_id: ModuleId::from("m1"),
        janus_id: ModuleId::from("j1"),
        created_at: chrono::Utc::now(),
        discard_at: None,
        nonce: nonce.to_string(),
    };
    stack
        .kv
        .put(
            &stack
                .layout
                .room_subkey(&RoomId::from(room_id), room_subkeys::LIVEMETA),
            serde_json::to_vec(&live).unwrap(),
            None,
        )
        .await
        .unwrap();
    // Give the room watcher a beat to fold the write in
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn mint_token(stack: &TestStack, room_id: &str) -> String {
    let (status, body) = request(
        &stack.router,
        json_request("POST", "/api/token", serde_json::json!({ "roomId": room_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["token"].as_str().unwrap().to_string()
}

fn key_request(room_id: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/hls/rooms/{room_id}/enc.key"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_content_key_derivation_and_repeatability() {
    let stack = stack().await;
    create_room(&stack, "room123").await;
    put_live(&stack, "room123", "nonce123", LiveStatus::Onair).await;

    let token = mint_token(&stack, "room123").await;
    let response = stack
        .router
        .clone()
        .oneshot(key_request("room123", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    let key = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(key.len(), 16);

    let expected = sha2::Sha256::digest(b"room123nonce123");
    assert_eq!(&key[..], &expected[..16]);

    // Unchanged nonce: same bytes again (served from the key cache)
    let (status, again) = request(&stack.router, key_request("room123", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, key.to_vec());

    stack.context.stop().await;
}

#[tokio::test]
async fn test_content_key_rotates_with_nonce() {
    let stack = stack().await;
    create_room(&stack, "room123").await;
    put_live(&stack, "room123", "nonce123", LiveStatus::Onair).await;
    let token = mint_token(&stack, "room123").await;

    let (_, first) = request(&stack.router, key_request("room123", &token)).await;
    put_live(&stack, "room123", "nonce456", LiveStatus::Onair).await;
    let (_, second) = request(&stack.router, key_request("room123", &token)).await;

    assert_ne!(first, second);
    let expected = sha2::Sha256::digest(b"room123nonce456");
    assert_eq!(&second[..], &expected[..16]);
    stack.context.stop().await;
}

#[tokio::test]
async fn test_content_key_scope_enforcement() {
    let stack = stack().await;
    create_room(&stack, "roomaaa").await;
    create_room(&stack, "roombbb").await;
    put_live(&stack, "roombbb", "nonce123", LiveStatus::Onair).await;

    // Token scoped to roomaaa must not unlock roombbb
    let token = mint_token(&stack, "roomaaa").await;
    let (status, body) = request(&stack.router, key_request("roombbb", &token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 2");
    stack.context.stop().await;
}

#[tokio::test]
async fn test_content_key_denials() {
    let stack = stack().await;
    create_room(&stack, "room123").await;

    // Malformed room id
    let token = mint_token(&stack, "room123").await;
    let (status, _) = request(&stack.router, key_request("x", &token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Missing bearer
    let no_auth = Request::builder()
        .method("GET")
        .uri("/hls/rooms/room123/enc.key")
        .body(Body::empty())
        .unwrap();
    let (status, body) = request(&stack.router, no_auth).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 1");

    // Garbage token
    let (status, body) = request(&stack.router, key_request("room123", "junk")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 1");

    // Valid token but no live broadcast
    let (status, body) = request(&stack.router, key_request("room123", &token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 3");

    // Broadcast winding down is not onair
    put_live(&stack, "room123", "nonce123", LiveStatus::Removing).await;
    let (status, body) = request(&stack.router, key_request("room123", &token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 3");

    stack.context.stop().await;
}

#[tokio::test]
async fn test_room_crud_and_generation() {
    let stack = stack().await;

    let (status, body) = request(
        &stack.router,
        json_request("POST", "/api/rooms", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let room_id = json["roomId"].as_str().unwrap().to_string();
    assert_eq!(room_id.len(), 20);
    assert_eq!(json["pin"].as_str().unwrap().len(), 6);
    assert_eq!(json["maxAnchors"], 3);
    assert_eq!(json["hlsPath"], format!("/hls/rooms/{room_id}"));

    // Duplicate conflicts
    let (status, _) = request(
        &stack.router,
        json_request("POST", "/api/rooms", serde_json::json!({ "roomId": room_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Fetch and list
    let get = Request::builder()
        .uri(format!("/api/rooms/{room_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&stack.router, get).await;
    assert_eq!(status, StatusCode::OK);

    let list = Request::builder()
        .uri("/api/rooms")
        .body(Body::empty())
        .unwrap();
    let (status, body) = request(&stack.router, list).await;
    assert_eq!(status, StatusCode::OK);
    let rooms: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(rooms.len(), 1);

    // Delete, then 404
    let del = Request::builder()
        .method("DELETE")
        .uri(format!("/api/rooms/{room_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&stack.router, del).await;
    assert_eq!(status, StatusCode::OK);
    let get = Request::builder()
        .uri(format!("/api/rooms/{room_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&stack.router, get).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    stack.context.stop().await;
}

#[tokio::test]
async fn test_broadcast_endpoints_write_live_metadata() {
    let stack = stack().await;
    create_room(&stack, "room123").await;

    let (status, body) = request(
        &stack.router,
        json_request("POST", "/api/rooms/room123/live", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "onair");
    assert_eq!(json["mixerId"], "m1");
    assert_eq!(json["janusId"], "j1");

    let (status, _) = request(
        &stack.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/rooms/room123/live")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let live: LiveMeta = serde_json::from_slice(
        &stack
            .kv
            .get(
                &stack
                    .layout
                    .room_subkey(&RoomId::from("room123"), room_subkeys::LIVEMETA),
                false,
            )
            .await
            .unwrap()
            .kvs[0]
            .value,
    )
    .unwrap();
    assert_eq!(live.status, LiveStatus::Removing);
    assert!(live.discard_at.is_some());

    stack.context.stop().await;
}

#[tokio::test]
async fn test_mark_endpoints() {
    let stack = stack().await;

    let (status, _) = request(
        &stack.router,
        json_request(
            "PUT",
            "/api/modules/mixers/m1/mark",
            serde_json::json!({ "label": "cordon" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Unknown label and module type are client errors
    let (status, _) = request(
        &stack.router,
        json_request(
            "PUT",
            "/api/modules/mixers/m1/mark",
            serde_json::json!({ "label": "paused" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = request(
        &stack.router,
        json_request(
            "PUT",
            "/api/modules/workers/m1/mark",
            serde_json::json!({ "label": "ready" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // TTL above the cap is rejected
    let (status, _) = request(
        &stack.router,
        json_request(
            "PUT",
            "/api/modules/mixers/m1/mark",
            serde_json::json!({ "label": "ready", "ttl": 86_401 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &stack.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/modules/mixers/m1/mark")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Module listing reflects the heartbeat
    let (status, body) = request(
        &stack.router,
        Request::builder()
            .uri("/api/modules/mixers")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let modules: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0]["moduleId"], "m1");
    assert_eq!(modules[0]["healthy"], true);

    stack.context.stop().await;
}

#[tokio::test]
async fn test_wrong_algorithm_token_is_denied() {
    let stack = stack().await;
    create_room(&stack, "room123").await;
    put_live(&stack, "room123", "nonce123", LiveStatus::Onair).await;

    // Same secret, different HS algorithm: the verifier refuses it
    let foreign = aircast_core::crypto::RoomTokenService::new(
        b"integration-test-secret",
        jsonwebtoken::Algorithm::HS384,
        chrono::Duration::hours(1),
    )
    .unwrap();
    let token = foreign
        .sign(
            &aircast_core::models::UserId::generate(),
            &RoomId::from("room123"),
        )
        .unwrap();

    let (status, body) = request(&stack.router, key_request("room123", &token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, b"Access denied 1");
    stack.context.stop().await;
}
