pub mod janitor;
pub mod modules;
pub mod room;

pub use janitor::DiscardJanitor;
pub use modules::ModuleAdminService;
pub use room::{CreateRoomRequest, RoomService};
