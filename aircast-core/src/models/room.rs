//! Room records stored in the coordination store.
//!
//! Each room owns four subkeys (`meta`, `livemeta`, `mixer`, `janus`); the
//! watcher assembles them into a [`RoomState`] aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ModuleId;
use crate::watch::Aggregate;
use crate::{Error, Result};

/// Static room parameters, written once by the room manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub pin: String,
    pub hls_path: String,
    pub max_anchors: u32,
    pub created_at: DateTime<Utc>,
}

/// Broadcast status of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    Onair,
    Removing,
}

/// Current broadcast state, mutated only at start/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMeta {
    pub status: LiveStatus,
    pub mixer_id: ModuleId,
    pub janus_id: ModuleId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discard_at: Option<DateTime<Utc>>,
    /// Per-broadcast random string; the HLS content key is derived from it.
    pub nonce: String,
}

/// Claim that a specific mixer currently mixes the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerAssignment {
    pub id: ModuleId,
    pub ip: String,
    pub port: u16,
}

/// Claim that a specific janus instance routes the room's media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JanusAssignment {
    pub id: ModuleId,
    pub status: String,
    pub janus_room_id: i64,
}

/// Room subkey names under `/<prefix-rooms>/<roomId>/`.
pub mod subkeys {
    pub const META: &str = "meta";
    pub const LIVEMETA: &str = "livemeta";
    pub const MIXER: &str = "mixer";
    pub const JANUS: &str = "janus";

    pub const ALL: &[&str] = &[META, LIVEMETA, MIXER, JANUS];
}

/// Per-room aggregate assembled from the four room subkeys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomState {
    pub meta: Option<RoomMeta>,
    pub live: Option<LiveMeta>,
    pub mixer: Option<MixerAssignment>,
    pub janus: Option<JanusAssignment>,
}

impl RoomState {
    /// Whether the room is currently broadcasting.
    #[must_use]
    pub fn is_onair(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|l| l.status == LiveStatus::Onair)
    }

    /// The mixer the live metadata says should run this room, if onair.
    #[must_use]
    pub fn desired_mixer(&self) -> Option<&ModuleId> {
        self.live
            .as_ref()
            .filter(|l| l.status == LiveStatus::Onair)
            .map(|l| &l.mixer_id)
    }

    /// The mixer named by the currently persisted assignment, if any.
    #[must_use]
    pub fn assigned_mixer(&self) -> Option<&ModuleId> {
        self.mixer.as_ref().map(|m| &m.id)
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(subkey: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("Failed to decode room {subkey}: {e}")))
}

impl Aggregate for RoomState {
    fn subkeys() -> &'static [&'static str] {
        subkeys::ALL
    }

    fn apply(&mut self, subkey: &str, value: Option<&[u8]>) -> Result<()> {
        match subkey {
            subkeys::META => self.meta = value.map(|v| decode_field(subkey, v)).transpose()?,
            subkeys::LIVEMETA => self.live = value.map(|v| decode_field(subkey, v)).transpose()?,
            subkeys::MIXER => self.mixer = value.map(|v| decode_field(subkey, v)).transpose()?,
            subkeys::JANUS => self.janus = value.map(|v| decode_field(subkey, v)).transpose()?,
            other => {
                return Err(Error::Internal(format!("Unknown room subkey: {other}")));
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.meta.is_none() && self.live.is_none() && self.mixer.is_none() && self.janus.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_live(status: LiveStatus) -> LiveMeta {
        LiveMeta {
            status,
            mixer_id: ModuleId::from("mixer-1"),
            janus_id: ModuleId::from("janus-1"),
            created_at: Utc::now(),
            discard_at: None,
            nonce: "nonce123".to_string(),
        }
    }

    #[test]
    fn test_live_meta_wire_format() {
        let live = sample_live(LiveStatus::Onair);
        let json = serde_json::to_value(&live).unwrap();
        assert_eq!(json["status"], "onair");
        assert_eq!(json["mixerId"], "mixer-1");
        assert_eq!(json["janusId"], "janus-1");
        assert_eq!(json["nonce"], "nonce123");
        // discardAt is omitted while unset
        assert!(json.get("discardAt").is_none());
    }

    #[test]
    fn test_room_meta_wire_format() {
        let meta = RoomMeta {
            pin: "a1b2c3".to_string(),
            hls_path: "/hls/rooms/room123".to_string(),
            max_anchors: 3,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["pin"], "a1b2c3");
        assert_eq!(json["hlsPath"], "/hls/rooms/room123");
        assert_eq!(json["maxAnchors"], 3);
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_aggregate_apply_and_clear() {
        let mut state = RoomState::default();
        assert!(state.is_empty());

        let live = sample_live(LiveStatus::Onair);
        let bytes = serde_json::to_vec(&live).unwrap();
        state.apply(subkeys::LIVEMETA, Some(&bytes)).unwrap();
        assert!(!state.is_empty());
        assert!(state.is_onair());
        assert_eq!(state.desired_mixer(), Some(&ModuleId::from("mixer-1")));

        state.apply(subkeys::LIVEMETA, None).unwrap();
        assert!(state.is_empty());
        assert!(!state.is_onair());
    }

    #[test]
    fn test_removing_room_has_no_desired_mixer() {
        let mut state = RoomState::default();
        let bytes = serde_json::to_vec(&sample_live(LiveStatus::Removing)).unwrap();
        state.apply(subkeys::LIVEMETA, Some(&bytes)).unwrap();
        assert!(!state.is_onair());
        assert!(state.desired_mixer().is_none());
    }

    #[test]
    fn test_unknown_subkey_rejected() {
        let mut state = RoomState::default();
        assert!(state.apply("bogus", Some(b"{}")).is_err());
    }
}
