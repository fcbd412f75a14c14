//! Keyed watcher over a coordination-store prefix.
//!
//! Keys under the prefix have the shape `<prefix><entityId>/<subkey>`. The
//! watcher folds the subkeys of each entity into an aggregate value, keeps
//! the aggregates cached, and dispatches a change handler per entity with
//! at-most-one invocation in flight per entity (concurrent across
//! entities). Lost watches are healed by re-reading a snapshot and
//! replaying the diff, so handlers may see duplicate states but never miss
//! a final one.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::kv::{KvStore, WatchEvent};
use crate::models::split_entity_key;
use crate::retry::Backoff;
use crate::Result;

/// Per-entity aggregate folded from whitelisted subkeys.
pub trait Aggregate: Clone + Default + PartialEq + Send + Sync + 'static {
    /// Subkey suffixes this aggregate consumes; all other keys under the
    /// prefix are ignored.
    fn subkeys() -> &'static [&'static str];

    /// Apply a put (`Some(bytes)`) or delete (`None`) of one subkey.
    fn apply(&mut self, subkey: &str, value: Option<&[u8]>) -> Result<()>;

    /// True when every field is absent; the entity is then dropped from the
    /// cache after its final dispatch.
    fn is_empty(&self) -> bool;
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Change handler: `(entity_id, current_state)`. Errors are logged and the
/// change is skipped; the next observed change retries.
pub type ChangeHandler<S> = Arc<dyn Fn(String, S) -> BoxFuture + Send + Sync>;

struct Gate<S> {
    pending: Option<S>,
}

struct Shared<S: Aggregate> {
    kv: Arc<dyn KvStore>,
    prefix: String,
    cache: RwLock<HashMap<String, S>>,
    handler: Option<ChangeHandler<S>>,
    /// One gate per entity with a handler invocation in flight.
    gates: Mutex<HashMap<String, Gate<S>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Watcher over `<prefix><entityId>/<subkey>` aggregates.
pub struct KeyedWatcher<S: Aggregate> {
    shared: Arc<Shared<S>>,
}

impl<S: Aggregate> KeyedWatcher<S> {
    /// `prefix` must end with `/`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self::with_handler_opt(kv, prefix, None)
    }

    #[must_use]
    pub fn with_handler(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        handler: ChangeHandler<S>,
    ) -> Self {
        Self::with_handler_opt(kv, prefix, Some(handler))
    }

    fn with_handler_opt(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        handler: Option<ChangeHandler<S>>,
    ) -> Self {
        let prefix = prefix.into();
        debug_assert!(prefix.ends_with('/'), "watch prefix must end with '/'");
        Self {
            shared: Arc::new(Shared {
                kv,
                prefix,
                cache: RwLock::new(HashMap::new()),
                handler,
                gates: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Read the initial snapshot into the cache, then follow the watch
    /// stream. Returns once the snapshot is materialized; consumers may
    /// read cached state immediately after.
    pub async fn start(&self) -> Result<()> {
        let shared = self.shared.clone();
        let resp = shared.kv.get(&shared.prefix, true).await?;

        let mut initial: HashMap<String, S> = HashMap::new();
        for kv in &resp.kvs {
            let Some((entity, subkey)) = split_entity_key(&shared.prefix, &kv.key) else {
                continue;
            };
            if !S::subkeys().contains(&subkey) {
                continue;
            }
            let state = initial.entry(entity.to_string()).or_default();
            if let Err(e) = state.apply(subkey, Some(&kv.value)) {
                tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable snapshot key");
            }
        }
        *shared.cache.write() = initial;

        let from_revision = resp.revision + 1;
        let loop_shared = shared.clone();
        shared.tracker.spawn(async move {
            loop_shared.run_watch_loop(from_revision).await;
        });

        tracing::debug!(prefix = %shared.prefix, revision = resp.revision, "Watcher started");
        Ok(())
    }

    /// Cancel the watch and wait for outstanding handlers to drain.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Snapshot one entity's aggregate. The clone is taken under the read
    /// lock, so callers never observe a half-applied state.
    #[must_use]
    pub fn get_cached(&self, entity_id: &str) -> Option<S> {
        self.shared.cache.read().get(entity_id).cloned()
    }

    /// Snapshot every cached entity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, S)> {
        self.shared
            .cache
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<S: Aggregate> Shared<S> {
    async fn run_watch_loop(self: Arc<Self>, mut from_revision: i64) {
        let mut backoff = Backoff::default();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.kv.watch(&self.prefix, true, from_revision).await {
                Ok(mut stream) => {
                    backoff.reset();
                    loop {
                        tokio::select! {
                            () = self.cancel.cancelled() => return,
                            event = stream.recv() => match event {
                                Some(event) => {
                                    from_revision = event.revision() + 1;
                                    self.apply_event(&event);
                                }
                                None => {
                                    tracing::warn!(prefix = %self.prefix, "Watch stream lost, resyncing");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(prefix = %self.prefix, error = %e, "Failed to open watch");
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }

            match self.resync().await {
                Ok(revision) => {
                    from_revision = revision + 1;
                }
                Err(e) => {
                    tracing::warn!(prefix = %self.prefix, error = %e, "Resync failed, retrying");
                }
            }
        }
    }

    /// Fold one watch event into the cache and dispatch the affected
    /// entity.
    fn apply_event(self: &Arc<Self>, event: &WatchEvent) {
        let key = event.key();
        let Some((entity, subkey)) = split_entity_key(&self.prefix, key) else {
            return;
        };
        if !S::subkeys().contains(&subkey) {
            return;
        }
        let value = match event {
            WatchEvent::Put(kv) => Some(kv.value.as_slice()),
            WatchEvent::Delete { .. } => None,
        };

        let state = {
            let mut cache = self.cache.write();
            let aggregate = cache.entry(entity.to_string()).or_default();
            if let Err(e) = aggregate.apply(subkey, value) {
                tracing::warn!(key = %key, error = %e, "Skipping undecodable change");
                return;
            }
            let state = aggregate.clone();
            if state.is_empty() {
                cache.remove(entity);
            }
            state
        };

        self.dispatch(entity.to_string(), state);
    }

    /// Re-read the prefix, swap the cache, and dispatch every entity whose
    /// aggregate changed while the watch was down. Removed entities are
    /// dispatched once with their empty aggregate.
    async fn resync(self: &Arc<Self>) -> Result<i64> {
        let resp = self.kv.get(&self.prefix, true).await?;

        let mut fresh: HashMap<String, S> = HashMap::new();
        for kv in &resp.kvs {
            let Some((entity, subkey)) = split_entity_key(&self.prefix, &kv.key) else {
                continue;
            };
            if !S::subkeys().contains(&subkey) {
                continue;
            }
            let state = fresh.entry(entity.to_string()).or_default();
            if let Err(e) = state.apply(subkey, Some(&kv.value)) {
                tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable snapshot key");
            }
        }

        let changed: Vec<(String, S)> = {
            let mut cache = self.cache.write();
            let mut changed = Vec::new();
            for (entity, state) in &fresh {
                if cache.get(entity) != Some(state) {
                    changed.push((entity.clone(), state.clone()));
                }
            }
            for entity in cache.keys() {
                if !fresh.contains_key(entity) {
                    changed.push((entity.clone(), S::default()));
                }
            }
            *cache = fresh;
            changed
        };

        let count = changed.len();
        for (entity, state) in changed {
            self.dispatch(entity, state);
        }
        if count > 0 {
            tracing::info!(prefix = %self.prefix, entities = count, "Replayed diff after watch loss");
        }
        Ok(resp.revision)
    }

    /// Hand `state` to the change handler, keeping at most one invocation
    /// in flight per entity. While one runs, later states collapse into a
    /// single pending slot, so the handler always converges on the latest.
    fn dispatch(self: &Arc<Self>, entity: String, state: S) {
        let Some(handler) = self.handler.clone() else {
            return;
        };

        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get_mut(&entity) {
            gate.pending = Some(state);
            return;
        }
        gates.insert(entity.clone(), Gate { pending: None });
        drop(gates);

        let shared = self.clone();
        self.tracker.spawn(async move {
            let mut current = state;
            loop {
                if let Err(e) = (handler)(entity.clone(), current).await {
                    tracing::warn!(entity = %entity, error = %e, "Change handler failed");
                }
                let next = {
                    let mut gates = shared.gates.lock();
                    let pending = gates
                        .get_mut(&entity)
                        .and_then(|gate| gate.pending.take());
                    if pending.is_none() {
                        gates.remove(&entity);
                    }
                    pending
                };
                match next {
                    Some(state) => current = state,
                    None => break,
                }
            }
        });
    }
}
