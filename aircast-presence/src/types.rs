//! Wire types for the user-status RPC surface.

use serde::{Deserialize, Serialize};

/// Part a user plays in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Anchor,
    Guest,
}

/// Reported user state within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Onair,
    Idle,
    Left,
}

/// `createUser` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserParams {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// `deleteUser` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserParams {
    pub room_id: String,
    pub user_id: String,
}

/// `setUserStatus` request. `gen` is the caller-supplied generation; stale
/// generations are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetUserStatusParams {
    pub room_id: String,
    pub user_id: String,
    pub status: UserStatus,
    pub gen: u64,
}

/// One member entry in a room-status broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: String,
    pub role: Role,
    pub status: UserStatus,
}

/// `broadcastRoomStatus` notification payload: active members only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRoomStatus {
    pub room_id: String,
    pub members: Vec<RoomMember>,
}

/// Membership record persisted per user for startup rebuild. The activity
/// clock restarts on rebuild, so no timestamp is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUser {
    pub role: Role,
    pub status: UserStatus,
    pub gen: u64,
}

/// Name of the fan-out notification method.
pub const BROADCAST_ROOM_STATUS: &str = "broadcastRoomStatus";
