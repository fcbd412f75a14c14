//! Coordination-store key layout.
//!
//! Layout (bit-exact):
//! - `/<prefix-rooms>/<roomId>/{meta|livemeta|mixer|janus}`
//! - `/<prefix-mixers>/<mixerId>/{heartbeat|mark}`
//! - `/<prefix-januses>/<janusId>/{heartbeat|mark}`
//!
//! All key construction goes through [`KeyLayout`] so no handler formats raw
//! key strings.

use serde::{Deserialize, Serialize};

use crate::models::{ModuleId, ModuleKind, RoomId};

/// Configurable key prefixes for the coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLayout {
    pub rooms_prefix: String,
    pub mixers_prefix: String,
    pub januses_prefix: String,
    pub gateways_prefix: String,
    pub presence_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            rooms_prefix: "/aircast/rooms".to_string(),
            mixers_prefix: "/aircast/mixers".to_string(),
            januses_prefix: "/aircast/januses".to_string(),
            gateways_prefix: "/aircast/gateways".to_string(),
            presence_prefix: "/aircast/presence".to_string(),
        }
    }
}

impl KeyLayout {
    /// Prefix under which all of a room's subkeys live, with trailing slash.
    #[must_use]
    pub fn rooms_root(&self) -> String {
        format!("{}/", self.rooms_prefix)
    }

    #[must_use]
    pub fn room_subkey(&self, room_id: &RoomId, subkey: &str) -> String {
        format!("{}/{}/{}", self.rooms_prefix, room_id, subkey)
    }

    /// Prefix covering every subkey of one room, with trailing slash.
    #[must_use]
    pub fn room_prefix(&self, room_id: &RoomId) -> String {
        format!("{}/{}/", self.rooms_prefix, room_id)
    }

    #[must_use]
    pub fn modules_root(&self, kind: ModuleKind) -> String {
        match kind {
            ModuleKind::Mixers => format!("{}/", self.mixers_prefix),
            ModuleKind::Januses => format!("{}/", self.januses_prefix),
        }
    }

    #[must_use]
    pub fn module_subkey(&self, kind: ModuleKind, id: &ModuleId, subkey: &str) -> String {
        let prefix = match kind {
            ModuleKind::Mixers => &self.mixers_prefix,
            ModuleKind::Januses => &self.januses_prefix,
        };
        format!("{prefix}/{id}/{subkey}")
    }

    /// Per-user single-session guard key.
    #[must_use]
    pub fn session_guard(&self, user_id: &crate::models::UserId) -> String {
        format!("{}/sessions/{}", self.gateways_prefix, user_id)
    }

    /// Prefix under which room membership records persist, with trailing
    /// slash.
    #[must_use]
    pub fn presence_root(&self) -> String {
        format!("{}/", self.presence_prefix)
    }

    #[must_use]
    pub fn presence_user(&self, room_id: &RoomId, user_id: &crate::models::UserId) -> String {
        format!("{}/{}/{}", self.presence_prefix, room_id, user_id)
    }

    /// Prefix covering one room's membership records, with trailing slash.
    #[must_use]
    pub fn presence_room(&self, room_id: &RoomId) -> String {
        format!("{}/{}/", self.presence_prefix, room_id)
    }
}

/// Split a full key under `prefix` (with trailing slash) into
/// `(entity_id, subkey)`. Returns `None` when the key does not match the
/// `prefix + entity + "/" + subkey` shape.
#[must_use]
pub fn split_entity_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?;
    let (entity, subkey) = rest.split_once('/')?;
    if entity.is_empty() || subkey.is_empty() || subkey.contains('/') {
        return None;
    }
    Some((entity, subkey))
}
