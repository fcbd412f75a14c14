//! Signaling gateway: owns the live WebSockets and relays room-status
//! fan-out from the status controller to the clients in each room.

pub mod guard;
pub mod hub;
pub mod notify;
pub mod ws;

pub use guard::{SessionClaim, SessionGuard, SessionLease, SessionPreempted, SESSION_PREEMPTED};
pub use hub::{ClientHub, FrameSender};
pub use notify::NotifyBridge;
pub use ws::{router, GatewayState};
