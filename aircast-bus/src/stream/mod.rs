//! Append-only stream bus abstraction.
//!
//! Streams carry flat string-field messages with monotonically increasing
//! `<ms-epoch>-<seq>` IDs. Consumer groups track delivery and pending
//! (delivered-but-unacked) entries per consumer. [`MemoryBus`] implements
//! the contract in-process; [`RedisBus`] maps it onto Redis streams.

pub mod consumer;
pub mod memory;
pub mod producer;
pub mod redis;
pub mod trimmer;

pub use consumer::{Consumer, ConsumerMode, Delivery};
pub use memory::MemoryBus;
pub use producer::Producer;
pub use redis::RedisBus;
pub use trimmer::Trimmer;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Open the configured bus. An empty Redis URL selects the in-process bus
/// (single-node deployments and tests).
pub fn connect(config: &aircast_core::config::BusConfig) -> Result<Arc<dyn StreamBus>> {
    if config.redis_url.is_empty() {
        return Ok(Arc::new(MemoryBus::new()));
    }
    Ok(Arc::new(RedisBus::new(&config.redis_url)?))
}

/// Stream entry ID: `<ms-epoch>-<seq>`, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    #[must_use]
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The smallest ID strictly greater than `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }

    /// Current wall-clock milliseconds since the epoch.
    #[must_use]
    pub fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::Bus(format!("Malformed stream ID: {s}")))?;
        Ok(Self {
            ms: ms
                .parse()
                .map_err(|_| Error::Bus(format!("Malformed stream ID: {s}")))?,
            seq: seq
                .parse()
                .map_err(|_| Error::Bus(format!("Malformed stream ID: {s}")))?,
        })
    }
}

/// Flat field map carried by one message.
pub type Fields = BTreeMap<String, String>;

/// One stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: StreamId,
    pub fields: Fields,
}

/// The stream-bus surface the transports consume.
#[async_trait]
pub trait StreamBus: Send + Sync + 'static {
    /// Append a message. `id: None` auto-generates a monotonic ID;
    /// an explicit ID must be strictly greater than the last one.
    async fn add(&self, stream: &str, id: Option<StreamId>, fields: Fields) -> Result<StreamId>;

    /// Read messages with IDs strictly after `after`, oldest first.
    /// With `block`, waits up to that long for new messages.
    async fn read(
        &self,
        stream: &str,
        after: StreamId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>>;

    /// Create the group at the stream tail if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Group read. `pending` replays this consumer's delivered-but-unacked
    /// entries; otherwise new entries are claimed from the group cursor.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        pending: bool,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>>;

    /// Acknowledge processed entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64>;

    /// Number of delivered-but-unacked entries across the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;

    /// Remove a consumer identity (discarding its pending entries).
    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<()>;

    /// Drop messages with IDs below `min_id`. With `acked_only`, messages
    /// still pending in any group are kept regardless.
    async fn trim_min_id(&self, stream: &str, min_id: StreamId, acked_only: bool) -> Result<u64>;

    /// Cap the stream at `max_len` messages, dropping oldest first. With
    /// `acked_only`, pending messages are kept regardless.
    async fn trim_max_len(&self, stream: &str, max_len: u64, acked_only: bool) -> Result<u64>;

    /// Number of messages currently in the stream.
    async fn len(&self, stream: &str) -> Result<u64>;
}
