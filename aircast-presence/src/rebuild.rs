//! Membership persistence for startup rebuild.
//!
//! The status controller owns room membership in memory; every mutation is
//! written through here so a restarted controller reconstructs its maps
//! before accepting RPCs. Activity clocks restart on rebuild: a user who
//! stays silent expires one timeout later.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use aircast_core::kv::KvStore;
use aircast_core::models::{split_entity_key, KeyLayout, RoomId, UserId};
use aircast_core::Result;

use crate::types::PersistedUser;

#[async_trait]
pub trait RoomsState: Send + Sync + 'static {
    /// Load every persisted membership record, grouped by room.
    async fn rebuild(&self) -> Result<HashMap<RoomId, HashMap<UserId, PersistedUser>>>;

    async fn save_user(&self, room_id: &RoomId, user_id: &UserId, user: &PersistedUser)
        -> Result<()>;

    async fn remove_user(&self, room_id: &RoomId, user_id: &UserId) -> Result<()>;
}

/// Coordination-store-backed membership records under the presence prefix.
pub struct KvRoomsState {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
}

impl KvRoomsState {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout) -> Self {
        Self { kv, layout }
    }
}

#[async_trait]
impl RoomsState for KvRoomsState {
    async fn rebuild(&self) -> Result<HashMap<RoomId, HashMap<UserId, PersistedUser>>> {
        let prefix = self.layout.presence_root();
        let resp = self.kv.get(&prefix, true).await?;

        let mut rooms: HashMap<RoomId, HashMap<UserId, PersistedUser>> = HashMap::new();
        for kv in &resp.kvs {
            let Some((room, user)) = split_entity_key(&prefix, &kv.key) else {
                continue;
            };
            match serde_json::from_slice::<PersistedUser>(&kv.value) {
                Ok(record) => {
                    rooms
                        .entry(RoomId::from(room))
                        .or_default()
                        .insert(UserId::from(user), record);
                }
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable membership record");
                }
            }
        }
        tracing::info!(rooms = rooms.len(), "Rebuilt membership state");
        Ok(rooms)
    }

    async fn save_user(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        user: &PersistedUser,
    ) -> Result<()> {
        self.kv
            .put(
                &self.layout.presence_user(room_id, user_id),
                serde_json::to_vec(user)?,
                None,
            )
            .await
    }

    async fn remove_user(&self, room_id: &RoomId, user_id: &UserId) -> Result<()> {
        self.kv
            .delete(&self.layout.presence_user(room_id, user_id), false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, UserStatus};
    use aircast_core::kv::MemoryKv;

    #[tokio::test]
    async fn test_save_rebuild_remove_round_trip() {
        let kv = MemoryKv::new();
        let state = KvRoomsState::new(Arc::new(kv), KeyLayout::default());
        let room = RoomId::from("room123");
        let user = UserId::from("u1");

        let record = PersistedUser {
            role: Role::Anchor,
            status: UserStatus::Idle,
            gen: 3,
        };
        state.save_user(&room, &user, &record).await.unwrap();

        let rooms = state.rebuild().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[&room][&user].gen, 3);
        assert_eq!(rooms[&room][&user].role, Role::Anchor);

        state.remove_user(&room, &user).await.unwrap();
        assert!(state.rebuild().await.unwrap().is_empty());
    }
}
