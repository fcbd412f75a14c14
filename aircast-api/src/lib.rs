//! Control HTTP surface of the aircast control plane: room lifecycle,
//! scope-token minting, HLS content keys, and module marks.

pub mod http;
pub mod service;

pub use http::{create_router, ApiContext, AppError, AppResult, AppState};
pub use service::{CreateRoomRequest, DiscardJanitor, ModuleAdminService, RoomService};
