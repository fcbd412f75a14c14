//! In-memory coordination store.
//!
//! Implements the full [`KvStore`] contract (revisions, prefix watches,
//! TTL leases with keep-alive) against process-local state. Used by tests
//! and single-node deployments; the event history is kept whole, which is
//! fine at that scale.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{GetResponse, KeepAliveStream, KeyValue, KvStore, LeaseId, WatchEvent, WatchStream};
use crate::{Error, Result};

/// How often the sweeper checks lease deadlines.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of each keep-alive tick channel.
const KEEPALIVE_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    mod_revision: i64,
    lease: LeaseId,
}

struct WatcherReg {
    key: String,
    with_prefix: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
    keepalive: Vec<mpsc::Sender<i64>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, StoredValue>,
    revision: i64,
    history: Vec<WatchEvent>,
    watchers: Vec<WatcherReg>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    sweeper_running: bool,
}

impl Inner {
    fn matches(key: &str, pattern: &str, with_prefix: bool) -> bool {
        if with_prefix {
            key.starts_with(pattern)
        } else {
            key == pattern
        }
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|w| {
                if Self::matches(event.key(), &w.key, w.with_prefix) {
                    w.tx.send(event.clone()).is_ok()
                } else {
                    !w.tx.is_closed()
                }
            });
        self.history.push(event);
    }

    fn detach_from_lease(&mut self, key: &str, lease: LeaseId) {
        if lease != 0 {
            if let Some(state) = self.leases.get_mut(&lease) {
                state.keys.remove(key);
            }
        }
    }

    /// Drop a lease and delete everything bound to it, emitting delete
    /// events at a single new revision.
    fn expire_lease(&mut self, id: LeaseId) {
        let Some(state) = self.leases.remove(&id) else {
            return;
        };
        drop(state.keepalive);
        if state.keys.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        for key in state.keys {
            if self.data.remove(&key).is_some() {
                self.emit(WatchEvent::Delete { key, revision });
            }
        }
    }
}

/// Process-local [`KvStore`] implementation.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Current store revision (test helper).
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Close every open watch stream without touching data. Chaos helper
    /// for exercising consumers' reconnect paths.
    pub fn sever_watches(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.watchers)
        };
        tracing::debug!(watchers = dropped.len(), "Severed watch streams");
    }

    fn ensure_sweeper(&self) {
        let mut inner = self.inner.lock();
        if inner.sweeper_running {
            return;
        }
        inner.sweeper_running = true;
        drop(inner);

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SWEEP_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let Some(strong) = weak.upgrade() else {
                    return;
                };
                let mut inner = strong.lock();
                let now = Instant::now();
                let mut expired = Vec::new();
                for (id, lease) in &mut inner.leases {
                    lease.keepalive.retain(|tx| !tx.is_closed());
                    if lease.keepalive.is_empty() {
                        if now >= lease.deadline {
                            expired.push(*id);
                        }
                    } else if lease.deadline.saturating_duration_since(now) < lease.ttl / 2 {
                        // An open keep-alive stream refreshes the lease.
                        lease.deadline = now + lease.ttl;
                        let ttl_secs = lease.ttl.as_secs() as i64;
                        for tx in &lease.keepalive {
                            let _ = tx.try_send(ttl_secs);
                        }
                    }
                }
                for id in expired {
                    tracing::debug!(lease = id, "Lease expired");
                    inner.expire_lease(id);
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str, with_prefix: bool) -> Result<GetResponse> {
        let inner = self.inner.lock();
        let kvs = inner
            .data
            .iter()
            .filter(|(k, _)| Inner::matches(k, key, with_prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                mod_revision: v.mod_revision,
                lease: v.lease,
            })
            .collect();
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let lease = lease.unwrap_or(0);
        let mut inner = self.inner.lock();
        if lease != 0 && !inner.leases.contains_key(&lease) {
            return Err(Error::Store(format!("Unknown lease: {lease}")));
        }
        inner.revision += 1;
        let revision = inner.revision;

        let prev_lease = inner.data.get(key).map(|p| p.lease);
        if let Some(prev_lease) = prev_lease {
            if prev_lease != lease {
                inner.detach_from_lease(key, prev_lease);
            }
        }
        if lease != 0 {
            if let Some(state) = inner.leases.get_mut(&lease) {
                state.keys.insert(key.to_string());
            }
        }
        inner.data.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );
        inner.emit(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
            mod_revision: revision,
            lease,
        }));
        Ok(())
    }

    async fn delete(&self, key: &str, with_prefix: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        let targets: Vec<String> = inner
            .data
            .keys()
            .filter(|k| Inner::matches(k, key, with_prefix))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }
        inner.revision += 1;
        let revision = inner.revision;
        for k in &targets {
            if let Some(prev) = inner.data.remove(k) {
                inner.detach_from_lease(k, prev.lease);
                inner.emit(WatchEvent::Delete {
                    key: k.clone(),
                    revision,
                });
            }
        }
        Ok(targets.len() as u64)
    }

    async fn watch(
        &self,
        key: &str,
        with_prefix: bool,
        from_revision: i64,
    ) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if from_revision > 0 {
            for event in &inner.history {
                if event.revision() >= from_revision
                    && Inner::matches(event.key(), key, with_prefix)
                {
                    let _ = tx.send(event.clone());
                }
            }
        }
        inner.watchers.push(WatcherReg {
            key: key.to_string(),
            with_prefix,
            tx,
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput("Lease TTL must be positive".to_string()));
        }
        self.ensure_sweeper();
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
                keepalive: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut inner = self.inner.lock();
        let state = inner
            .leases
            .get_mut(&lease)
            .ok_or_else(|| Error::Store(format!("Unknown lease: {lease}")))?;
        let (tx, rx) = mpsc::channel(KEEPALIVE_CAPACITY);
        state.deadline = Instant::now() + state.ttl;
        state.keepalive.push(tx);
        Ok(rx)
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.expire_lease(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_revision() {
        let kv = MemoryKv::new();
        kv.put("/a/1", b"one".to_vec(), None).await.unwrap();
        kv.put("/a/2", b"two".to_vec(), None).await.unwrap();

        let resp = kv.get("/a/1", false).await.unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].value, b"one");
        assert_eq!(resp.revision, 2);

        let all = kv.get("/a/", true).await.unwrap();
        assert_eq!(all.kvs.len(), 2);
        // BTreeMap keeps keys sorted
        assert_eq!(all.kvs[0].key, "/a/1");
        assert_eq!(all.kvs[1].key, "/a/2");
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let kv = MemoryKv::new();
        kv.put("/a/1", b"one".to_vec(), None).await.unwrap();
        let snap = kv.get("/a/", true).await.unwrap();

        let mut watch = kv.watch("/a/", true, snap.revision + 1).await.unwrap();
        kv.put("/a/2", b"two".to_vec(), None).await.unwrap();
        kv.delete("/a/1", false).await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.key(), "/a/2");
        let second = watch.recv().await.unwrap();
        assert!(matches!(second, WatchEvent::Delete { .. }));
        assert_eq!(second.key(), "/a/1");
    }

    #[tokio::test]
    async fn test_watch_replays_history() {
        let kv = MemoryKv::new();
        kv.put("/a/1", b"one".to_vec(), None).await.unwrap();
        kv.put("/b/1", b"other".to_vec(), None).await.unwrap();

        // Watching from revision 1 replays the matching put
        let mut watch = kv.watch("/a/", true, 1).await.unwrap();
        let event = watch.recv().await.unwrap();
        assert_eq!(event.key(), "/a/1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let kv = MemoryKv::new();
        let lease = kv.lease_grant(Duration::from_secs(1)).await.unwrap();
        kv.put("/a/1", b"one".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        // Let the sweeper run
        tokio::task::yield_now().await;

        let resp = kv.get("/a/1", false).await.unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_lease() {
        let kv = MemoryKv::new();
        let lease = kv.lease_grant(Duration::from_secs(1)).await.unwrap();
        kv.put("/a/1", b"one".to_vec(), Some(lease)).await.unwrap();
        let stream = kv.keep_alive(lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        let resp = kv.get("/a/1", false).await.unwrap();
        assert_eq!(resp.kvs.len(), 1);

        // Dropping the stream lets the lease lapse
        drop(stream);
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        let resp = kv.get("/a/1", false).await.unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_notifies() {
        let kv = MemoryKv::new();
        let lease = kv.lease_grant(Duration::from_secs(60)).await.unwrap();
        kv.put("/a/1", b"one".to_vec(), Some(lease)).await.unwrap();
        let snap = kv.get("/a/", true).await.unwrap();
        let mut watch = kv.watch("/a/", true, snap.revision + 1).await.unwrap();

        kv.lease_revoke(lease).await.unwrap();

        let event = watch.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Delete { .. }));
        assert_eq!(event.key(), "/a/1");
        assert!(kv.get("/a/1", false).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_rejected() {
        let kv = MemoryKv::new();
        let result = kv.put("/a/1", b"one".to_vec(), Some(42)).await;
        assert!(result.is_err());
    }
}
