// Module: http
// Control-plane REST surface: rooms, tokens, content keys, module marks.

pub mod error;
pub mod health;
pub mod keys;
pub mod marks;
pub mod middleware;
pub mod rooms;
pub mod users;

use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use aircast_bus::{ConsumerMode, Peer, StreamBus};
use aircast_core::config::Config;
use aircast_core::crypto::{ContentKeyCache, RoomTokenService};
use aircast_core::kv::KvStore;
use aircast_core::models::RoomState;
use aircast_core::pick::ResourceManager;
use aircast_core::watch::{ChangeHandler, KeyedWatcher};
use aircast_core::Result;

use crate::service::{DiscardJanitor, ModuleAdminService, RoomService};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub room_service: Arc<RoomService>,
    pub module_service: Arc<ModuleAdminService>,
    pub status_peer: Arc<Peer>,
    pub tokens: RoomTokenService,
    pub key_cache: Arc<ContentKeyCache>,
    pub rooms_watcher: Arc<KeyedWatcher<RoomState>>,
}

/// Running API wiring; `stop` tears it down in reverse start order.
pub struct ApiContext {
    pub state: AppState,
    resources: Arc<ResourceManager>,
    janitor: Arc<DiscardJanitor>,
}

impl ApiContext {
    /// Wire watchers, services and the status peer, returning the router
    /// and the teardown handle.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn StreamBus>,
        config: &Config,
    ) -> Result<(Router, Self)> {
        let layout = config.kv.layout.clone();

        let resources = Arc::new(ResourceManager::new(kv.clone(), &layout));
        resources.start().await?;

        let key_cache = Arc::new(ContentKeyCache::new());
        let janitor = Arc::new(DiscardJanitor::start(kv.clone(), layout.clone()));

        // Every observed room change drops that room's cached content key
        // (nonce rotation must not serve stale bytes) and feeds the
        // discard janitor.
        let on_room_change: ChangeHandler<RoomState> = {
            let key_cache = key_cache.clone();
            let janitor = janitor.clone();
            Arc::new(move |entity, state| {
                let key_cache = key_cache.clone();
                let janitor = janitor.clone();
                Box::pin(async move {
                    key_cache.invalidate(&aircast_core::models::RoomId::from_string(
                        entity.clone(),
                    ));
                    janitor.observe(&entity, &state).await;
                    Ok(())
                })
            })
        };
        let rooms_watcher = Arc::new(KeyedWatcher::with_handler(
            kv.clone(),
            layout.rooms_root(),
            on_room_change,
        ));
        rooms_watcher.start().await?;

        let tokens = RoomTokenService::new(
            config.token.secret.as_bytes(),
            config.token.parse_algorithm()?,
            chrono::Duration::hours(config.token.token_ttl_hours),
        )?;

        let status_peer = Arc::new(Peer::new(
            bus,
            config.bus.status_request_stream.clone(),
            config.bus.status_reply_stream.clone(),
            ConsumerMode::Broadcast,
        ));
        status_peer
            .open()
            .await
            .map_err(|e| aircast_core::Error::Unavailable(format!("Status peer: {e}")))?;

        let state = AppState {
            room_service: Arc::new(RoomService::new(kv.clone(), layout.clone(), resources.clone())),
            module_service: Arc::new(ModuleAdminService::new(kv, layout, resources.clone())),
            status_peer,
            tokens,
            key_cache,
            rooms_watcher,
        };

        Ok((
            create_router(state.clone()),
            Self {
                state,
                resources,
                janitor,
            },
        ))
    }

    pub async fn stop(&self) {
        self.state.status_peer.close().await;
        self.state.rooms_watcher.stop().await;
        self.janitor.stop().await;
        self.resources.stop().await;
    }
}

/// Build the router over prepared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/token", post(keys::mint_token))
        .route("/hls/rooms/{room_id}/enc.key", get(keys::content_key))
        .route("/api/rooms", post(rooms::create_room))
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{room_id}", get(rooms::get_room))
        .route("/api/rooms/{room_id}", delete(rooms::delete_room))
        .route("/api/rooms/{room_id}/live", post(rooms::start_live))
        .route("/api/rooms/{room_id}/live", delete(rooms::stop_live))
        .route("/api/rooms/{room_id}/users", post(users::create_user))
        .route(
            "/api/rooms/{room_id}/users/{user_id}",
            delete(users::delete_user),
        )
        .route("/api/modules/{kind}", get(marks::list_modules))
        .route("/api/modules/{kind}/{id}/mark", put(marks::set_mark))
        .route("/api/modules/{kind}/{id}/mark", delete(marks::clear_mark))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
