//! User-status controller: the single writer for room membership.

pub mod controller;
pub mod rebuild;
pub mod service;
pub mod types;

pub use controller::{StatusSettings, User, UserStatusController};
pub use rebuild::{KvRoomsState, RoomsState};
pub use service::PresenceService;
pub use types::{
    CreateUserParams, DeleteUserParams, NotifyRoomStatus, Role, RoomMember, SetUserStatusParams,
    UserStatus, BROADCAST_ROOM_STATUS,
};
