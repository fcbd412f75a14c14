//! Input validation for the control-plane surfaces.

use regex::Regex;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Bounds for validated input types.
pub mod limits {
    /// Minimum room ID length
    pub const ROOM_ID_MIN: usize = 3;
    /// Maximum room ID length
    pub const ROOM_ID_MAX: usize = 32;
    /// Maximum mark TTL in seconds (one day)
    pub const MARK_TTL_MAX: u64 = 86_400;
    /// Broadcaster cap bounds per room
    pub const MAX_ANCHORS_MIN: u32 = 1;
    pub const MAX_ANCHORS_MAX: u32 = 5;
    /// Default broadcaster cap
    pub const MAX_ANCHORS_DEFAULT: u32 = 3;
}

static ROOM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid room_id regex"));

/// Validate a room ID: 3–32 chars of `[A-Za-z0-9_-]`.
pub fn validate_room_id(room_id: &str) -> Result<()> {
    let len = room_id.len();
    if !(limits::ROOM_ID_MIN..=limits::ROOM_ID_MAX).contains(&len) {
        return Err(Error::InvalidInput(format!(
            "room_id must be {}-{} characters",
            limits::ROOM_ID_MIN,
            limits::ROOM_ID_MAX
        )));
    }
    if !ROOM_ID.is_match(room_id) {
        return Err(Error::InvalidInput(
            "room_id contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate a mark TTL: 0 (no expiry) up to one day.
pub fn validate_mark_ttl(ttl: u64) -> Result<()> {
    if ttl > limits::MARK_TTL_MAX {
        return Err(Error::InvalidInput(format!(
            "ttl must be at most {} seconds",
            limits::MARK_TTL_MAX
        )));
    }
    Ok(())
}

/// Clamp a requested broadcaster cap into the allowed range, defaulting
/// when absent.
#[must_use]
pub fn clamp_max_anchors(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(limits::MAX_ANCHORS_DEFAULT)
        .clamp(limits::MAX_ANCHORS_MIN, limits::MAX_ANCHORS_MAX)
}

/// Generate a 6-hex-char room pin.
#[must_use]
pub fn generate_pin() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 3] = rng.gen();
    hex::encode(bytes)
}
