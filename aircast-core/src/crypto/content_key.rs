//! HLS content-key derivation and cache.
//!
//! The AES-128 segment key for a broadcast is deterministic:
//! `SHA-256(roomId ∥ nonce)[0..16]`, where the nonce rotates per broadcast.
//! Derived keys sit in a small LRU so repeated playlist fetches skip the
//! room-state lookup.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

use crate::models::RoomId;

/// Cache capacity: more rooms than are ever concurrently live.
const KEY_CACHE_CAPACITY: usize = 100;

pub const CONTENT_KEY_LEN: usize = 16;

/// Derive the AES-128 content key for one broadcast.
#[must_use]
pub fn derive_content_key(room_id: &RoomId, nonce: &str) -> [u8; CONTENT_KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(room_id.as_str().as_bytes());
    hasher.update(nonce.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; CONTENT_KEY_LEN];
    key.copy_from_slice(&digest[..CONTENT_KEY_LEN]);
    key
}

/// Concurrent LRU of derived content keys.
pub struct ContentKeyCache {
    inner: Mutex<LruCache<RoomId, [u8; CONTENT_KEY_LEN]>>,
}

impl Default for ContentKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentKeyCache {
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::unwrap_used)]
        let capacity = NonZeroUsize::new(KEY_CACHE_CAPACITY).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<[u8; CONTENT_KEY_LEN]> {
        self.inner.lock().get(room_id).copied()
    }

    pub fn insert(&self, room_id: RoomId, key: [u8; CONTENT_KEY_LEN]) {
        self.inner.lock().put(room_id, key);
    }

    /// Drop a room's cached key (nonce rotated or broadcast ended).
    pub fn invalidate(&self, room_id: &RoomId) {
        self.inner.lock().pop(room_id);
    }
}
