//! Mixer worker wiring: heartbeat + room watcher + convergence controller.

use std::sync::Arc;
use std::time::Duration;

use aircast_core::config::Config;
use aircast_core::heartbeat::Heartbeat;
use aircast_core::kv::KvStore;
use aircast_core::models::module::subkeys;
use aircast_core::models::{
    HeartbeatStatus, ModuleHeartbeat, ModuleId, ModuleKind, RoomId, RoomState,
};
use aircast_core::watch::{ChangeHandler, KeyedWatcher};
use aircast_core::Result;

use crate::controller::MixerController;
use crate::pipeline::AudioPipeline;

pub struct MixerWorker {
    heartbeat: Heartbeat,
    watcher: Arc<KeyedWatcher<RoomState>>,
    controller: Arc<MixerController>,
}

impl MixerWorker {
    /// Build and start the worker: room watcher first (so convergence
    /// state is warm), then the heartbeat that makes this mixer pickable.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        config: &Config,
        pipeline: Arc<dyn AudioPipeline>,
    ) -> Result<Self> {
        let module_id = if config.mixer.module_id.is_empty() {
            ModuleId::from_string(config.server.effective_server_id())
        } else {
            ModuleId::from_string(config.mixer.module_id.clone())
        };
        let layout = config.kv.layout.clone();

        let controller = Arc::new(MixerController::new(
            kv.clone(),
            layout.clone(),
            module_id.clone(),
            config.mixer.advertise_host.clone(),
            (config.mixer.port_start, config.mixer.port_end),
            pipeline,
        ));

        let handler: ChangeHandler<RoomState> = {
            let controller = controller.clone();
            Arc::new(move |entity, state| {
                let controller = controller.clone();
                Box::pin(async move {
                    let room_id = RoomId::from_string(entity);
                    controller.on_room_change(&room_id, &state).await
                })
            })
        };
        let watcher = Arc::new(KeyedWatcher::with_handler(
            kv.clone(),
            layout.rooms_root(),
            handler,
        ));
        watcher.start().await?;

        let identity = ModuleHeartbeat {
            status: HeartbeatStatus::Healthy,
            host: config.mixer.advertise_host.clone(),
            capacity: config.mixer.capacity,
            started_at: chrono::Utc::now(),
        };
        let mut heartbeat = Heartbeat::new(
            kv,
            layout.module_subkey(ModuleKind::Mixers, &module_id, subkeys::HEARTBEAT),
            serde_json::to_vec(&identity)?,
            Duration::from_secs(config.mixer.heartbeat_ttl_secs),
        )?;
        heartbeat.start().await?;

        tracing::info!(module_id = %module_id, "Mixer worker started");
        Ok(Self {
            heartbeat,
            watcher,
            controller,
        })
    }

    /// Shut down in reverse start order: drop the heartbeat (stop being
    /// pickable), stop observing, then kill local pipelines.
    pub async fn stop(&mut self) {
        self.heartbeat.stop().await;
        self.watcher.stop().await;
        self.controller.shutdown().await;
        tracing::info!("Mixer worker stopped");
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<MixerController> {
        &self.controller
    }
}
