//! Lease-bound identity heartbeat.
//!
//! Keeps a process-identity key alive in the coordination store: grants a
//! lease, writes the key bound to it, and holds a keep-alive stream open.
//! When the keep-alive stream closes (lease lost, store restart, network
//! partition longer than the TTL) the whole sequence is re-established
//! under backoff until cancelled. Consumers treat absence of the key as
//! "this identity is down" and must debounce brief flaps.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::kv::{KvStore, LeaseId};
use crate::retry::Backoff;
use crate::{Error, Result};

/// Timeout for the best-effort lease revoke on shutdown.
const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Heartbeat {
    kv: Arc<dyn KvStore>,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Result<Self> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput("Heartbeat TTL must be positive".to_string()));
        }
        Ok(Self {
            kv,
            key: key.into(),
            value,
            ttl,
            cancel: CancellationToken::new(),
            monitor: None,
        })
    }

    /// Establish the lease-bound key and start the keep-alive monitor.
    /// Fails only if the very first establishment fails; later losses are
    /// healed by the monitor.
    pub async fn start(&mut self) -> Result<()> {
        let lease = establish(&*self.kv, &self.key, &self.value, self.ttl).await?;

        let kv = self.kv.clone();
        let key = self.key.clone();
        let value = self.value.clone();
        let ttl = self.ttl;
        let cancel = self.cancel.clone();

        self.monitor = Some(tokio::spawn(async move {
            monitor_loop(kv, key, value, ttl, lease, cancel).await;
        }));
        Ok(())
    }

    /// Cancel the monitor and best-effort revoke the current lease.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
    }
}

/// One full establishment: lease grant, leased put. Returns the lease.
async fn establish(kv: &dyn KvStore, key: &str, value: &[u8], ttl: Duration) -> Result<LeaseId> {
    let lease = kv.lease_grant(ttl).await?;
    kv.put(key, value.to_vec(), Some(lease)).await?;
    Ok(lease)
}

async fn monitor_loop(
    kv: Arc<dyn KvStore>,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    initial_lease: LeaseId,
    cancel: CancellationToken,
) {
    let mut lease = Some(initial_lease);
    let mut backoff = Backoff::default();

    loop {
        let current = match lease.take() {
            Some(id) => id,
            None => {
                // Re-establish after a loss, retrying indefinitely.
                match establish(&*kv, &key, &value, ttl).await {
                    Ok(id) => {
                        tracing::info!(key = %key, lease = id, "Heartbeat re-established");
                        backoff.reset();
                        id
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Heartbeat re-establish failed");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(backoff.next_delay()) => continue,
                        }
                    }
                }
            }
        };

        let mut stream = match kv.keep_alive(current).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key = %key, lease = current, error = %e, "Keep-alive open failed");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff.next_delay()) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    revoke_best_effort(&*kv, &key, current).await;
                    return;
                }
                tick = stream.recv() => match tick {
                    Some(_) => {}
                    None => {
                        // Lease lost: key is gone, go back to establishment.
                        tracing::warn!(key = %key, lease = current, "Keep-alive stream closed, lease lost");
                        break;
                    }
                },
            }
        }
    }
}

async fn revoke_best_effort(kv: &dyn KvStore, key: &str, lease: LeaseId) {
    match tokio::time::timeout(REVOKE_TIMEOUT, kv.lease_revoke(lease)).await {
        Ok(Ok(())) => {
            tracing::debug!(key = %key, lease = lease, "Heartbeat lease revoked");
        }
        Ok(Err(e)) => {
            tracing::warn!(key = %key, lease = lease, error = %e, "Lease revoke failed");
        }
        Err(_) => {
            tracing::warn!(key = %key, lease = lease, "Lease revoke timed out");
        }
    }
}
