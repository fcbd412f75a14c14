//! Worker module records: heartbeat and mark subkeys plus derived predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watch::Aggregate;
use crate::{Error, Result};

/// Module kind: which pool a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Mixers,
    Januses,
}

impl ModuleKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mixers => "mixers",
            Self::Januses => "januses",
        }
    }
}

impl std::str::FromStr for ModuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mixers" => Ok(Self::Mixers),
            "januses" => Ok(Self::Januses),
            other => Err(Error::InvalidInput(format!("Unknown module type: {other}"))),
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat status published by a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Healthy,
}

/// Lease-bound identity record a worker keeps alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleHeartbeat {
    pub status: HeartbeatStatus,
    pub host: String,
    pub capacity: u32,
    pub started_at: DateTime<Utc>,
}

/// Operator-set scheduling label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkLabel {
    Ready,
    Cordon,
    Draining,
    Drained,
    Unready,
}

impl std::str::FromStr for MarkLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(Self::Ready),
            "cordon" => Ok(Self::Cordon),
            "draining" => Ok(Self::Draining),
            "drained" => Ok(Self::Drained),
            "unready" => Ok(Self::Unready),
            other => Err(Error::InvalidInput(format!("Unknown mark label: {other}"))),
        }
    }
}

/// Mark record stored next to the heartbeat, optionally lease-bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub label: MarkLabel,
}

/// Module subkey names under `/<prefix>/<moduleId>/`.
pub mod subkeys {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const MARK: &str = "mark";

    pub const ALL: &[&str] = &[HEARTBEAT, MARK];
}

/// Per-module aggregate assembled from heartbeat + mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleState {
    pub heartbeat: Option<ModuleHeartbeat>,
    pub mark: Option<Mark>,
}

impl ModuleState {
    /// Heartbeat present and reporting healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.heartbeat
            .as_ref()
            .is_some_and(|h| h.status == HeartbeatStatus::Healthy)
    }

    /// Healthy and schedulable: no mark, or an explicit `ready` mark.
    #[must_use]
    pub fn is_pickable(&self) -> bool {
        self.is_healthy()
            && match self.mark {
                None => true,
                Some(m) => m.label == MarkLabel::Ready,
            }
    }

    /// Healthy and not being drained: existing work may stay.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.is_healthy()
            && match self.mark {
                None => true,
                Some(m) => matches!(m.label, MarkLabel::Ready | MarkLabel::Cordon),
            }
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(subkey: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("Failed to decode module {subkey}: {e}")))
}

impl Aggregate for ModuleState {
    fn subkeys() -> &'static [&'static str] {
        subkeys::ALL
    }

    fn apply(&mut self, subkey: &str, value: Option<&[u8]>) -> Result<()> {
        match subkey {
            subkeys::HEARTBEAT => {
                self.heartbeat = value.map(|v| decode_field(subkey, v)).transpose()?;
            }
            subkeys::MARK => self.mark = value.map(|v| decode_field(subkey, v)).transpose()?,
            other => {
                return Err(Error::Internal(format!("Unknown module subkey: {other}")));
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.heartbeat.is_none() && self.mark.is_none()
    }
}
