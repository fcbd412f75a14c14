//! Room lifecycle over the coordination store.
//!
//! The room manager is the only writer of `meta` and `livemeta`; mixers
//! and the key issuer observe them through watchers.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;

use aircast_core::kv::KvStore;
use aircast_core::models::room::subkeys;
use aircast_core::models::{KeyLayout, LiveMeta, LiveStatus, RoomId, RoomMeta};
use aircast_core::pick::ResourceManager;
use aircast_core::validation::{clamp_max_anchors, generate_pin, validate_room_id};
use aircast_core::{Error, Result};

/// Grace period between stop and final discard of live metadata.
const DISCARD_GRACE: chrono::Duration = chrono::Duration::minutes(5);

pub struct CreateRoomRequest {
    pub room_id: Option<String>,
    pub pin: Option<String>,
    pub max_anchors: Option<u32>,
}

pub struct RoomService {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    resources: Arc<ResourceManager>,
}

impl RoomService {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout, resources: Arc<ResourceManager>) -> Self {
        Self {
            kv,
            layout,
            resources,
        }
    }

    /// Create a room, generating any missing fields.
    pub async fn create_room(&self, req: CreateRoomRequest) -> Result<(RoomId, RoomMeta)> {
        let room_id = match req.room_id {
            Some(id) => {
                validate_room_id(&id)?;
                RoomId::from_string(id)
            }
            None => RoomId::generate(),
        };

        let meta_key = self.layout.room_subkey(&room_id, subkeys::META);
        if !self.kv.get(&meta_key, false).await?.kvs.is_empty() {
            return Err(Error::AlreadyExists(format!("Room {room_id} already exists")));
        }

        let meta = RoomMeta {
            pin: req.pin.unwrap_or_else(generate_pin),
            hls_path: format!("/hls/rooms/{room_id}"),
            max_anchors: clamp_max_anchors(req.max_anchors),
            created_at: Utc::now(),
        };
        self.kv
            .put(&meta_key, serde_json::to_vec(&meta)?, None)
            .await?;
        tracing::info!(room_id = %room_id, max_anchors = meta.max_anchors, "Room created");
        Ok((room_id, meta))
    }

    pub async fn get_room(&self, room_id: &RoomId) -> Result<(RoomMeta, Option<LiveMeta>)> {
        let resp = self
            .kv
            .get(&self.layout.room_prefix(room_id), true)
            .await?;

        let mut meta = None;
        let mut live = None;
        for kv in &resp.kvs {
            if kv.key.ends_with("/meta") {
                meta = Some(serde_json::from_slice::<RoomMeta>(&kv.value)?);
            } else if kv.key.ends_with("/livemeta") {
                live = Some(serde_json::from_slice::<LiveMeta>(&kv.value)?);
            }
        }
        meta.map(|m| (m, live))
            .ok_or_else(|| Error::NotFound(format!("Room {room_id} not found")))
    }

    pub async fn list_rooms(&self) -> Result<Vec<(RoomId, RoomMeta)>> {
        let root = self.layout.rooms_root();
        let resp = self.kv.get(&root, true).await?;

        let mut rooms = Vec::new();
        for kv in &resp.kvs {
            let Some((entity, subkey)) = aircast_core::models::split_entity_key(&root, &kv.key)
            else {
                continue;
            };
            if subkey != subkeys::META {
                continue;
            }
            match serde_json::from_slice::<RoomMeta>(&kv.value) {
                Ok(meta) => rooms.push((RoomId::from(entity), meta)),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable room meta");
                }
            }
        }
        Ok(rooms)
    }

    /// Remove the room entirely. A live broadcast is wound down first so
    /// the owning mixer observes `removing` before the keys disappear.
    pub async fn delete_room(&self, room_id: &RoomId) -> Result<()> {
        let (_, live) = self.get_room(room_id).await?;
        if live.is_some_and(|l| l.status == LiveStatus::Onair) {
            self.stop_broadcast(room_id).await?;
        }
        self.kv
            .delete(&self.layout.room_prefix(room_id), true)
            .await?;
        tracing::info!(room_id = %room_id, "Room deleted");
        Ok(())
    }

    /// Start a broadcast: pick workers, roll a fresh nonce, write the
    /// live metadata the mixers converge on.
    pub async fn start_broadcast(&self, room_id: &RoomId) -> Result<LiveMeta> {
        let (_, live) = self.get_room(room_id).await?;
        if live.is_some_and(|l| l.status == LiveStatus::Onair) {
            return Err(Error::AlreadyExists(format!(
                "Room {room_id} is already onair"
            )));
        }

        let mixer_id = self.resources.pick_mixer()?;
        let janus_id = self.resources.pick_janus()?;
        let live = LiveMeta {
            status: LiveStatus::Onair,
            mixer_id,
            janus_id,
            created_at: Utc::now(),
            discard_at: None,
            nonce: generate_nonce(),
        };
        self.kv
            .put(
                &self.layout.room_subkey(room_id, subkeys::LIVEMETA),
                serde_json::to_vec(&live)?,
                None,
            )
            .await?;
        tracing::info!(
            room_id = %room_id,
            mixer_id = %live.mixer_id,
            janus_id = %live.janus_id,
            "Broadcast started"
        );
        Ok(live)
    }

    /// Wind a broadcast down: flip the status to `removing` with a
    /// discard instant; the assigned mixer stops and cleans up its
    /// assignment on observation.
    pub async fn stop_broadcast(&self, room_id: &RoomId) -> Result<LiveMeta> {
        let (_, live) = self.get_room(room_id).await?;
        let Some(mut live) = live else {
            return Err(Error::NotFound(format!("Room {room_id} is not live")));
        };
        if live.status == LiveStatus::Removing {
            return Ok(live);
        }

        live.status = LiveStatus::Removing;
        live.discard_at = Some(Utc::now() + DISCARD_GRACE);
        self.kv
            .put(
                &self.layout.room_subkey(room_id, subkeys::LIVEMETA),
                serde_json::to_vec(&live)?,
                None,
            )
            .await?;
        tracing::info!(room_id = %room_id, "Broadcast stopping");
        Ok(live)
    }
}

/// Per-broadcast random nonce feeding content-key derivation.
fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_core::kv::MemoryKv;
    use aircast_core::models::module::{subkeys as module_subkeys, HeartbeatStatus, ModuleHeartbeat};
    use aircast_core::models::{ModuleId, ModuleKind};

    async fn service_with_modules(kv: &MemoryKv) -> RoomService {
        let layout = KeyLayout::default();
        for (kind, id) in [(ModuleKind::Mixers, "m1"), (ModuleKind::Januses, "j1")] {
            let hb = ModuleHeartbeat {
                status: HeartbeatStatus::Healthy,
                host: "127.0.0.1".to_string(),
                capacity: 8,
                started_at: Utc::now(),
            };
            kv.put(
                &layout.module_subkey(kind, &ModuleId::from(id), module_subkeys::HEARTBEAT),
                serde_json::to_vec(&hb).unwrap(),
                None,
            )
            .await
            .unwrap();
        }
        let resources = Arc::new(ResourceManager::new(Arc::new(kv.clone()), &layout));
        resources.start().await.unwrap();
        RoomService::new(Arc::new(kv.clone()), layout, resources)
    }

    #[tokio::test]
    async fn test_create_room_generates_missing_fields() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;

        let (room_id, meta) = service
            .create_room(CreateRoomRequest {
                room_id: None,
                pin: None,
                max_anchors: None,
            })
            .await
            .unwrap();

        assert_eq!(room_id.as_str().len(), 20);
        assert_eq!(meta.pin.len(), 6);
        assert_eq!(meta.max_anchors, 3);
        assert_eq!(meta.hls_path, format!("/hls/rooms/{room_id}"));
    }

    #[tokio::test]
    async fn test_create_room_conflicts_on_existing_id() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;

        let req = || CreateRoomRequest {
            room_id: Some("room123".to_string()),
            pin: None,
            max_anchors: Some(2),
        };
        service.create_room(req()).await.unwrap();
        assert!(matches!(
            service.create_room(req()).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_room_rejects_bad_id() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;
        let result = service
            .create_room(CreateRoomRequest {
                room_id: Some("x".to_string()),
                pin: None,
                max_anchors: None,
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_broadcast_lifecycle() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;
        let (room_id, _) = service
            .create_room(CreateRoomRequest {
                room_id: Some("room123".to_string()),
                pin: None,
                max_anchors: None,
            })
            .await
            .unwrap();

        let live = service.start_broadcast(&room_id).await.unwrap();
        assert_eq!(live.status, LiveStatus::Onair);
        assert_eq!(live.mixer_id, ModuleId::from("m1"));
        assert_eq!(live.nonce.len(), 32);

        // Double start conflicts
        assert!(matches!(
            service.start_broadcast(&room_id).await,
            Err(Error::AlreadyExists(_))
        ));

        let stopped = service.stop_broadcast(&room_id).await.unwrap();
        assert_eq!(stopped.status, LiveStatus::Removing);
        assert!(stopped.discard_at.is_some());

        // Stop is idempotent
        let again = service.stop_broadcast(&room_id).await.unwrap();
        assert_eq!(again.status, LiveStatus::Removing);
    }

    #[tokio::test]
    async fn test_delete_room_removes_all_subkeys() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;
        let (room_id, _) = service
            .create_room(CreateRoomRequest {
                room_id: Some("room123".to_string()),
                pin: None,
                max_anchors: None,
            })
            .await
            .unwrap();
        service.start_broadcast(&room_id).await.unwrap();

        service.delete_room(&room_id).await.unwrap();
        assert!(matches!(
            service.get_room(&room_id).await,
            Err(Error::NotFound(_))
        ));
        let leftovers = kv
            .get(&KeyLayout::default().room_prefix(&room_id), true)
            .await
            .unwrap();
        assert!(leftovers.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_max_anchors_clamped() {
        let kv = MemoryKv::new();
        let service = service_with_modules(&kv).await;
        let (_, meta) = service
            .create_room(CreateRoomRequest {
                room_id: None,
                pin: None,
                max_anchors: Some(99),
            })
            .await
            .unwrap();
        assert_eq!(meta.max_anchors, 5);
    }
}
