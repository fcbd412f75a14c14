//! Coordination-store abstraction.
//!
//! The control plane talks to a strongly-consistent, revisioned key-value
//! store with prefix watches and TTL leases. Production deployments plug in
//! an external store behind [`KvStore`]; [`MemoryKv`] implements the same
//! contract in-process for tests and single-node setups.

pub mod memory;

pub use memory::MemoryKv;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::KvConfig;
use crate::{Error, Result};

/// Lease identifier. `0` means "no lease".
pub type LeaseId = i64;

/// A stored key-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which this key was last modified.
    pub mod_revision: i64,
    pub lease: LeaseId,
}

/// Result of a read: the matching pairs plus the store revision the read
/// was served at. A watch opened at `revision + 1` observes every later
/// change without gaps.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Change event delivered on a watch stream, in revision order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    #[must_use]
    pub const fn revision(&self) -> i64 {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { revision, .. } => *revision,
        }
    }
}

/// Ordered stream of watch events. The channel closing means the watch was
/// lost; the consumer re-reads a snapshot and re-watches.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Keep-alive ticks for a lease (remaining TTL in seconds). The channel
/// closing means the lease is gone and everything bound to it has expired.
pub type KeepAliveStream = mpsc::Receiver<i64>;

/// The §external coordination-store surface the core consumes.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a key, or every key under it when `with_prefix` is set.
    async fn get(&self, key: &str, with_prefix: bool) -> Result<GetResponse>;

    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    /// Delete a key (or prefix). Returns the number of keys removed.
    async fn delete(&self, key: &str, with_prefix: bool) -> Result<u64>;

    /// Watch a key (or prefix) for changes at or after `from_revision`.
    async fn watch(&self, key: &str, with_prefix: bool, from_revision: i64)
        -> Result<WatchStream>;

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Keep a lease alive for as long as the returned stream is held open.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, expiring all keys bound to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;
}

/// Open the configured coordination store. Empty `endpoints` selects the
/// in-process store (single-node deployments and tests); an external
/// driver is wired in by the deployment, not this crate.
pub fn connect(config: &KvConfig) -> Result<Arc<dyn KvStore>> {
    if config.endpoints.is_empty() {
        return Ok(Arc::new(MemoryKv::new()));
    }
    Err(Error::Unavailable(format!(
        "No driver for coordination-store endpoints {:?}; wire one behind kv::KvStore",
        config.endpoints
    )))
}
