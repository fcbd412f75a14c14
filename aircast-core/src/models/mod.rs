pub mod id;
pub mod keys;
pub mod module;
pub mod room;

pub use id::{generate_id, ConnectionId, ModuleId, RoomId, UserId};
pub use keys::{split_entity_key, KeyLayout};
pub use module::{
    HeartbeatStatus, Mark, MarkLabel, ModuleHeartbeat, ModuleKind, ModuleState,
};
pub use room::{JanusAssignment, LiveMeta, LiveStatus, MixerAssignment, RoomMeta, RoomState};
