//! Single-writer room-membership actor.
//!
//! All mutations funnel through one mailbox and are applied one at a time,
//! so per-room state never races. Out-of-order writes from different
//! publishers are resolved by the caller-supplied generation counter. A
//! periodic sweep expires users that stopped updating and fans one
//! `broadcastRoomStatus` notification out per affected room.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use aircast_bus::{Notifier, RpcError};
use aircast_core::models::{RoomId, RoomState, UserId};
use aircast_core::watch::KeyedWatcher;
use aircast_core::{Error, Result};

use crate::rebuild::RoomsState;
use crate::types::{
    CreateUserParams, DeleteUserParams, NotifyRoomStatus, PersistedUser, Role, RoomMember,
    SetUserStatusParams, UserStatus, BROADCAST_ROOM_STATUS,
};

/// In-memory membership record. The activity clock is process-local.
#[derive(Debug, Clone)]
pub struct User {
    pub role: Role,
    pub status: UserStatus,
    pub last_update: Instant,
    pub gen: u64,
}

impl User {
    fn is_active(&self, now: Instant, timeout: Duration) -> bool {
        self.status != UserStatus::Left && now.duration_since(self.last_update) <= timeout
    }

    fn persisted(&self) -> PersistedUser {
        PersistedUser {
            role: self.role,
            status: self.status,
            gen: self.gen,
        }
    }
}

type RpcResult = std::result::Result<Value, RpcError>;
type ReplySender = oneshot::Sender<RpcResult>;

enum Action {
    Create(CreateUserParams, ReplySender),
    Delete(DeleteUserParams, ReplySender),
    SetStatus(SetUserStatusParams, ReplySender),
}

#[derive(Debug, Clone)]
pub struct StatusSettings {
    pub tick_interval: Duration,
    pub user_timeout: Duration,
    pub mailbox_capacity: usize,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            user_timeout: Duration::from_secs(30),
            mailbox_capacity: 100,
        }
    }
}

/// Handle to the status actor; RPC handlers enqueue and await the reply.
pub struct UserStatusController {
    tx: mpsc::Sender<Action>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UserStatusController {
    /// Rebuild membership from persistence, then start the actor loop.
    pub async fn start(
        settings: StatusSettings,
        rooms_watcher: Arc<KeyedWatcher<RoomState>>,
        notifier: Notifier,
        store: Arc<dyn RoomsState>,
    ) -> Result<Self> {
        let persisted = store.rebuild().await?;
        let now = Instant::now();
        let rooms = persisted
            .into_iter()
            .map(|(room, users)| {
                let users = users
                    .into_iter()
                    .map(|(user_id, record)| {
                        (
                            user_id,
                            User {
                                role: record.role,
                                status: record.status,
                                last_update: now,
                                gen: record.gen,
                            },
                        )
                    })
                    .collect();
                (room, users)
            })
            .collect();

        let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
        let cancel = CancellationToken::new();
        let actor = Actor {
            rooms,
            rooms_watcher,
            notifier,
            store,
            timeout: settings.user_timeout,
        };
        let task = tokio::spawn(actor.run(rx, settings.tick_interval, cancel.clone()));

        Ok(Self {
            tx,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub async fn create_user(&self, params: CreateUserParams) -> RpcResult {
        self.send(|reply| Action::Create(params, reply)).await
    }

    pub async fn delete_user(&self, params: DeleteUserParams) -> RpcResult {
        self.send(|reply| Action::Delete(params, reply)).await
    }

    pub async fn set_user_status(&self, params: SetUserStatusParams) -> RpcResult {
        self.send(|reply| Action::SetStatus(params, reply)).await
    }

    async fn send(&self, make: impl FnOnce(ReplySender) -> Action) -> RpcResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RpcError::internal("Status actor gone"))?;
        reply_rx
            .await
            .map_err(|_| RpcError::internal("Status actor dropped the request"))?
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Actor {
    rooms: HashMap<RoomId, HashMap<UserId, User>>,
    rooms_watcher: Arc<KeyedWatcher<RoomState>>,
    notifier: Notifier,
    store: Arc<dyn RoomsState>,
    timeout: Duration,
}

impl Actor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Action>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it.
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                action = rx.recv() => match action {
                    Some(action) => self.apply(action).await,
                    None => return,
                },
                _ = tick.tick() => self.check_timeout().await,
            }
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::Create(params, reply) => {
                let result = self.create(params).await;
                let _ = reply.send(result);
            }
            Action::Delete(params, reply) => {
                let result = self.delete(params).await;
                let _ = reply.send(result);
            }
            Action::SetStatus(params, reply) => {
                let result = self.set_status(params).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Broadcaster cap for a room, from the cached room aggregate.
    fn max_anchors(&self, room_id: &RoomId) -> Option<u32> {
        self.rooms_watcher
            .get_cached(room_id.as_str())
            .and_then(|state| state.meta)
            .map(|meta| meta.max_anchors)
    }

    fn active_count(&self, room_id: &RoomId, now: Instant) -> usize {
        self.rooms
            .get(room_id)
            .map(|users| {
                users
                    .values()
                    .filter(|u| u.is_active(now, self.timeout))
                    .count()
            })
            .unwrap_or(0)
    }

    async fn create(&mut self, params: CreateUserParams) -> RpcResult {
        let room_id = RoomId::from_string(params.room_id.clone());
        let user_id = UserId::from_string(params.user_id.clone());
        let now = Instant::now();

        let Some(max_anchors) = self.max_anchors(&room_id) else {
            return Err(RpcError::invalid_request("invalid request"));
        };
        let already_present = self
            .rooms
            .get(&room_id)
            .is_some_and(|users| users.contains_key(&user_id));
        if !already_present && self.active_count(&room_id, now) >= max_anchors as usize {
            return Err(RpcError::invalid_request("invalid request"));
        }

        let prior_gen = self
            .rooms
            .get(&room_id)
            .and_then(|users| users.get(&user_id))
            .map_or(0, |u| u.gen);
        let user = User {
            role: params.role.unwrap_or(Role::Guest),
            status: UserStatus::Idle,
            last_update: now,
            gen: prior_gen,
        };

        self.store
            .save_user(&room_id, &user_id, &user.persisted())
            .await
            .map_err(internal)?;
        self.rooms
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.clone(), user);

        tracing::info!(room_id = %room_id, user_id = %user_id, "User created");
        self.broadcast_room(&room_id).await;
        Ok(serde_json::json!({ "roomId": params.room_id, "userId": params.user_id }))
    }

    async fn delete(&mut self, params: DeleteUserParams) -> RpcResult {
        let room_id = RoomId::from_string(params.room_id);
        let user_id = UserId::from_string(params.user_id);

        let removed = self
            .rooms
            .get_mut(&room_id)
            .and_then(|users| users.remove(&user_id))
            .is_some();
        if removed {
            if let Some(users) = self.rooms.get(&room_id) {
                if users.is_empty() {
                    self.rooms.remove(&room_id);
                }
            }
            self.store
                .remove_user(&room_id, &user_id)
                .await
                .map_err(internal)?;
            tracing::info!(room_id = %room_id, user_id = %user_id, "User deleted");
            self.broadcast_room(&room_id).await;
        }
        Ok(Value::Null)
    }

    async fn set_status(&mut self, params: SetUserStatusParams) -> RpcResult {
        let room_id = RoomId::from_string(params.room_id);
        let user_id = UserId::from_string(params.user_id);
        let now = Instant::now();

        let Some(user) = self
            .rooms
            .get_mut(&room_id)
            .and_then(|users| users.get_mut(&user_id))
        else {
            return Err(RpcError::invalid_request("invalid request"));
        };

        if params.gen < user.gen {
            tracing::debug!(
                room_id = %room_id,
                user_id = %user_id,
                stored_gen = user.gen,
                incoming_gen = params.gen,
                "Dropping stale status update"
            );
            return Ok(Value::Null);
        }

        user.status = params.status;
        user.gen = params.gen;
        user.last_update = now;
        let record = user.persisted();

        self.store
            .save_user(&room_id, &user_id, &record)
            .await
            .map_err(internal)?;
        self.broadcast_room(&room_id).await;
        Ok(Value::Null)
    }

    /// Expire users that stopped updating; one broadcast per touched room.
    async fn check_timeout(&mut self) {
        let now = Instant::now();
        let mut affected: Vec<RoomId> = Vec::new();

        for (room_id, users) in &mut self.rooms {
            let mut touched = false;
            for (user_id, user) in users.iter_mut() {
                if user.status != UserStatus::Left
                    && now.duration_since(user.last_update) > self.timeout
                {
                    tracing::info!(room_id = %room_id, user_id = %user_id, "User timed out");
                    user.status = UserStatus::Left;
                    touched = true;
                    if let Err(e) = self
                        .store
                        .save_user(room_id, user_id, &user.persisted())
                        .await
                    {
                        tracing::warn!(room_id = %room_id, user_id = %user_id, error = %e, "Failed to persist timeout");
                    }
                }
            }
            if touched {
                affected.push(room_id.clone());
            }
        }

        for room_id in affected {
            self.broadcast_room(&room_id).await;
        }
    }

    /// Publish the room's active members to every gateway.
    async fn broadcast_room(&self, room_id: &RoomId) {
        let now = Instant::now();
        let mut members: Vec<RoomMember> = self
            .rooms
            .get(room_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, u)| u.is_active(now, self.timeout))
                    .map(|(user_id, u)| RoomMember {
                        user_id: user_id.to_string(),
                        role: u.role,
                        status: u.status,
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let payload = NotifyRoomStatus {
            room_id: room_id.to_string(),
            members,
        };
        match serde_json::to_value(&payload) {
            Ok(value) => {
                if let Err(e) = self.notifier.notify(BROADCAST_ROOM_STATUS, value).await {
                    tracing::warn!(room_id = %room_id, error = %e, "Room-status broadcast failed");
                }
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "Room-status payload unserializable");
            }
        }
    }
}

fn internal(e: Error) -> RpcError {
    RpcError::internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebuild::KvRoomsState;
    use aircast_bus::{Envelope, MemoryBus, StreamBus};
    use aircast_core::kv::{KvStore, MemoryKv};
    use aircast_core::models::room::subkeys;
    use aircast_core::models::{KeyLayout, RoomMeta};

    struct Harness {
        controller: UserStatusController,
        bus: Arc<MemoryBus>,
        kv: MemoryKv,
        watcher: Arc<KeyedWatcher<RoomState>>,
    }

    async fn harness(settings: StatusSettings) -> Harness {
        let kv = MemoryKv::new();
        let layout = KeyLayout::default();
        let bus = Arc::new(MemoryBus::new());

        let watcher: Arc<KeyedWatcher<RoomState>> = Arc::new(KeyedWatcher::new(
            Arc::new(kv.clone()),
            layout.rooms_root(),
        ));
        watcher.start().await.unwrap();

        let notifier = Notifier::new(bus.clone() as Arc<dyn StreamBus>, "notify");
        let store = Arc::new(KvRoomsState::new(Arc::new(kv.clone()), layout));
        let controller = UserStatusController::start(settings, watcher.clone(), notifier, store)
            .await
            .unwrap();

        Harness {
            controller,
            bus,
            kv,
            watcher,
        }
    }

    async fn put_room_meta(harness: &Harness, room: &str, max_anchors: u32) {
        let meta = RoomMeta {
            pin: "a1b2c3".to_string(),
            hls_path: format!("/hls/rooms/{room}"),
            max_anchors,
            created_at: chrono::Utc::now(),
        };
        harness
            .kv
            .put(
                &KeyLayout::default().room_subkey(&RoomId::from(room), subkeys::META),
                serde_json::to_vec(&meta).unwrap(),
                None,
            )
            .await
            .unwrap();
        // Let the watcher fold the put into its cache
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if harness.watcher.get_cached(room).is_some() {
                break;
            }
        }
    }

    async fn drain_notifications(bus: &Arc<MemoryBus>) -> Vec<NotifyRoomStatus> {
        let msgs = bus
            .read("notify", aircast_bus::StreamId::ZERO, 1000, None)
            .await
            .unwrap();
        msgs.iter()
            .map(|m| {
                let envelope: Envelope = serde_json::from_str(&m.fields["payload"]).unwrap();
                match envelope {
                    Envelope::Notification { method, params } => {
                        assert_eq!(method, BROADCAST_ROOM_STATUS);
                        serde_json::from_value(params).unwrap()
                    }
                    other => panic!("unexpected envelope: {other:?}"),
                }
            })
            .collect()
    }

    fn create(room: &str, user: &str, role: Role) -> CreateUserParams {
        CreateUserParams {
            room_id: room.to_string(),
            user_id: user.to_string(),
            role: Some(role),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_caps_active_users() {
        let h = harness(StatusSettings::default()).await;
        put_room_meta(&h, "room123", 3).await;

        for user in ["u1", "u2", "u3"] {
            h.controller
                .create_user(create("room123", user, Role::Anchor))
                .await
                .unwrap();
        }

        // Third create broadcast carries all three members
        let notifications = drain_notifications(&h.bus).await;
        assert_eq!(notifications.last().unwrap().members.len(), 3);

        // Fourth is rejected at admission
        let err = h
            .controller
            .create_user(create("room123", "u4", Role::Anchor))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_REQUEST);
        assert_eq!(err.message, "invalid request");

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_room_rejected() {
        let h = harness(StatusSettings::default()).await;
        let err = h
            .controller
            .create_user(create("nowhere", "u1", Role::Guest))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_REQUEST);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_dropped() {
        let h = harness(StatusSettings::default()).await;
        put_room_meta(&h, "room123", 3).await;
        h.controller
            .create_user(create("room123", "u1", Role::Host))
            .await
            .unwrap();

        let set = |status, gen| SetUserStatusParams {
            room_id: "room123".to_string(),
            user_id: "u1".to_string(),
            status,
            gen,
        };
        h.controller
            .set_user_status(set(UserStatus::Onair, 5))
            .await
            .unwrap();
        h.controller
            .set_user_status(set(UserStatus::Idle, 3))
            .await
            .unwrap();

        let notifications = drain_notifications(&h.bus).await;
        let last = notifications.last().unwrap();
        // The stale write did not flip the status back
        assert_eq!(last.members[0].status, UserStatus::Onair);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user_status_rejected() {
        let h = harness(StatusSettings::default()).await;
        put_room_meta(&h, "room123", 3).await;
        let err = h
            .controller
            .set_user_status(SetUserStatusParams {
                room_id: "room123".to_string(),
                user_id: "ghost".to_string(),
                status: UserStatus::Onair,
                gen: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_REQUEST);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_user_expires_and_room_broadcasts() {
        let h = harness(StatusSettings::default()).await;
        put_room_meta(&h, "room123", 3).await;
        h.controller
            .create_user(create("room123", "u1", Role::Anchor))
            .await
            .unwrap();

        // Past the 30s activity window; the 10s sweep runs several times
        tokio::time::advance(Duration::from_secs(45)).await;
        tokio::task::yield_now().await;

        let notifications = drain_notifications(&h.bus).await;
        let last = notifications.last().unwrap();
        assert_eq!(last.room_id, "room123");
        assert!(last.members.is_empty());
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_user_broadcasts_remaining() {
        let h = harness(StatusSettings::default()).await;
        put_room_meta(&h, "room123", 3).await;
        h.controller
            .create_user(create("room123", "u1", Role::Host))
            .await
            .unwrap();
        h.controller
            .create_user(create("room123", "u2", Role::Guest))
            .await
            .unwrap();

        h.controller
            .delete_user(DeleteUserParams {
                room_id: "room123".to_string(),
                user_id: "u1".to_string(),
            })
            .await
            .unwrap();

        let notifications = drain_notifications(&h.bus).await;
        let last = notifications.last().unwrap();
        assert_eq!(last.members.len(), 1);
        assert_eq!(last.members[0].user_id, "u2");
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_restores_membership() {
        let kv = MemoryKv::new();
        let layout = KeyLayout::default();
        let store = KvRoomsState::new(Arc::new(kv.clone()), layout.clone());
        store
            .save_user(
                &RoomId::from("room123"),
                &UserId::from("u1"),
                &PersistedUser {
                    role: Role::Host,
                    status: UserStatus::Idle,
                    gen: 9,
                },
            )
            .await
            .unwrap();

        let bus = Arc::new(MemoryBus::new());
        let watcher: Arc<KeyedWatcher<RoomState>> = Arc::new(KeyedWatcher::new(
            Arc::new(kv.clone()),
            layout.rooms_root(),
        ));
        watcher.start().await.unwrap();
        let controller = UserStatusController::start(
            StatusSettings::default(),
            watcher,
            Notifier::new(bus.clone() as Arc<dyn StreamBus>, "notify"),
            Arc::new(store),
        )
        .await
        .unwrap();

        // The restored generation still guards stale updates
        controller
            .set_user_status(SetUserStatusParams {
                room_id: "room123".to_string(),
                user_id: "u1".to_string(),
                status: UserStatus::Onair,
                gen: 4,
            })
            .await
            .unwrap();
        assert!(drain_notifications(&bus).await.is_empty());

        // A fresh generation goes through
        controller
            .set_user_status(SetUserStatusParams {
                room_id: "room123".to_string(),
                user_id: "u1".to_string(),
                status: UserStatus::Onair,
                gen: 10,
            })
            .await
            .unwrap();
        let notifications = drain_notifications(&bus).await;
        assert_eq!(
            notifications.last().unwrap().members[0].status,
            UserStatus::Onair
        );
        controller.stop().await;
    }
}
