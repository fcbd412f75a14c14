//! Coordination fabric for the aircast control plane.
//!
//! Everything here is transport-agnostic: the KV store and stream bus are
//! consumed through traits, and the service crates (`aircast-api`,
//! `aircast-mixer`, `aircast-presence`, `aircast-gateway`) wire the pieces
//! together.

pub mod config;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod kv;
pub mod logging;
pub mod models;
pub mod pick;
pub mod retry;
pub mod time;
pub mod validation;
pub mod watch;

pub use config::Config;
pub use error::{Error, Result};
pub use heartbeat::Heartbeat;
pub use pick::{Picker, ResourceManager};
pub use time::{KeyedScheduler, Zset};
pub use watch::{Aggregate, KeyedWatcher};
