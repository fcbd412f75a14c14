//! RPC surface of the status controller.
//!
//! Requests arrive on the shared request stream through a consumer group
//! (each request is processed by exactly one controller instance); replies
//! go back on the reply stream; room-status notifications fan out on a
//! broadcast stream every gateway follows.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use aircast_bus::{parse_params, ConsumerMode, Notifier, Peer, StreamBus, Trimmer};
use aircast_core::config::Config;
use aircast_core::kv::KvStore;
use aircast_core::models::RoomState;
use aircast_core::watch::KeyedWatcher;
use aircast_core::{Error, Result};

use crate::controller::{StatusSettings, UserStatusController};
use crate::rebuild::KvRoomsState;

pub struct PresenceService {
    peer: Arc<Peer>,
    controller: Arc<UserStatusController>,
    rooms_watcher: Arc<KeyedWatcher<RoomState>>,
    trim_cancel: CancellationToken,
}

impl PresenceService {
    /// Rebuild state, start the actor, then open the RPC peer.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn StreamBus>,
        config: &Config,
    ) -> Result<Self> {
        let layout = config.kv.layout.clone();

        let rooms_watcher: Arc<KeyedWatcher<RoomState>> =
            Arc::new(KeyedWatcher::new(kv.clone(), layout.rooms_root()));
        rooms_watcher.start().await?;

        let settings = StatusSettings {
            tick_interval: std::time::Duration::from_secs(config.presence.tick_interval_secs),
            user_timeout: std::time::Duration::from_secs(config.presence.user_timeout_secs),
            mailbox_capacity: config.presence.mailbox_capacity,
        };
        let notifier = Notifier::new(bus.clone(), config.bus.status_notify_stream.clone());
        let store = Arc::new(KvRoomsState::new(kv, layout));
        let controller = Arc::new(
            UserStatusController::start(settings, rooms_watcher.clone(), notifier, store).await?,
        );

        let consumer_name = if config.presence.consumer_name.is_empty() {
            config.server.effective_server_id()
        } else {
            config.presence.consumer_name.clone()
        };
        let peer = Arc::new(Peer::new(
            bus.clone(),
            config.bus.status_reply_stream.clone(),
            config.bus.status_request_stream.clone(),
            ConsumerMode::Group {
                group: config.bus.status_group.clone(),
                consumer: consumer_name,
            },
        ));
        register_methods(&peer, &controller);
        peer.open()
            .await
            .map_err(|e| Error::Unavailable(format!("Failed to open status peer: {e}")))?;

        // Bound the RPC streams; acked traffic older than the window or
        // beyond the length cap is dropped.
        let trim_cancel = CancellationToken::new();
        let trim_interval = Duration::from_secs(config.bus.trim_interval_secs);
        let trim_max_age = Duration::from_secs(config.bus.trim_max_age_secs);
        let trim_max_len = config.bus.trim_max_len;
        for stream in [
            config.bus.status_request_stream.clone(),
            config.bus.status_reply_stream.clone(),
            config.bus.status_notify_stream.clone(),
        ] {
            let trimmer = Trimmer::new(bus.clone(), stream);
            let cancel = trim_cancel.clone();
            tokio::spawn(async move {
                trimmer
                    .run(trim_interval, trim_max_age, trim_max_len, cancel)
                    .await;
            });
        }

        tracing::info!("Status controller serving");
        Ok(Self {
            peer,
            controller,
            rooms_watcher,
            trim_cancel,
        })
    }

    pub async fn stop(&self) {
        self.trim_cancel.cancel();
        self.peer.close().await;
        self.controller.stop().await;
        self.rooms_watcher.stop().await;
        tracing::info!("Status controller stopped");
    }
}

fn register_methods(peer: &Arc<Peer>, controller: &Arc<UserStatusController>) {
    {
        let controller = controller.clone();
        peer.def_async("createUser", move |params, reply| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let result = match parse_params(params) {
                    Ok(parsed) => controller.create_user(parsed).await,
                    Err(e) => Err(e),
                };
                reply.send(result).await;
            });
        });
    }
    {
        let controller = controller.clone();
        peer.def_async("deleteUser", move |params, reply| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let result = match parse_params(params) {
                    Ok(parsed) => controller.delete_user(parsed).await,
                    Err(e) => Err(e),
                };
                reply.send(result).await;
            });
        });
    }
    {
        let controller = controller.clone();
        peer.def_async("setUserStatus", move |params, reply| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let result = match parse_params(params) {
                    Ok(parsed) => controller.set_user_status(parsed).await,
                    Err(e) => Err(e),
                };
                reply.send(result).await;
            });
        });
    }
}
