pub mod scheduler;
pub mod zset;

pub use scheduler::KeyedScheduler;
pub use zset::{Entry, Zset};
