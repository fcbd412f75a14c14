//! Cross-process single-session guard.
//!
//! A user may hold at most one live WebSocket session across all
//! gateways. Each session is claimed by a lease-bound key under the
//! gateways prefix holding `{serverId, connId}`; the lease dies with the
//! gateway, so crashed holders release automatically. A newer claim
//! overwrites the key and publishes a preemption notice on the gateway
//! broadcast stream; the previous holder closes its socket when it sees
//! the notice.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use aircast_bus::Notifier;
use aircast_core::heartbeat::Heartbeat;
use aircast_core::kv::KvStore;
use aircast_core::models::{ConnectionId, KeyLayout, UserId};
use aircast_core::Result;

/// Method name of the preemption notice.
pub const SESSION_PREEMPTED: &str = "sessionPreempted";

/// Stored claim for a user's single session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaim {
    pub server_id: String,
    pub conn_id: ConnectionId,
}

/// Preemption notice published when a claim is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPreempted {
    pub user_id: String,
    pub server_id: String,
    pub conn_id: ConnectionId,
}

/// Live claim: dropping it (via [`SessionGuard::release`]) frees the key.
pub struct SessionLease {
    heartbeat: Heartbeat,
}

pub struct SessionGuard {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    server_id: String,
    ttl: Duration,
    notifier: Notifier,
}

impl SessionGuard {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        layout: KeyLayout,
        server_id: String,
        ttl: Duration,
        notifier: Notifier,
    ) -> Self {
        Self {
            kv,
            layout,
            server_id,
            ttl,
            notifier,
        }
    }

    /// Claim the user's session slot for `conn_id`. Any existing claim is
    /// overwritten and its holder notified to drop the old connection.
    pub async fn acquire(&self, user_id: &UserId, conn_id: &ConnectionId) -> Result<SessionLease> {
        let key = self.layout.session_guard(user_id);

        let existing = self.kv.get(&key, false).await?;
        if let Some(kv) = existing.kvs.first() {
            match serde_json::from_slice::<SessionClaim>(&kv.value) {
                Ok(previous) => {
                    tracing::info!(
                        user_id = %user_id,
                        previous_server = %previous.server_id,
                        previous_conn = %previous.conn_id,
                        "Preempting existing session"
                    );
                    let notice = SessionPreempted {
                        user_id: user_id.to_string(),
                        server_id: previous.server_id,
                        conn_id: previous.conn_id,
                    };
                    if let Err(e) = self
                        .notifier
                        .notify(SESSION_PREEMPTED, serde_json::to_value(&notice)?)
                        .await
                    {
                        tracing::warn!(user_id = %user_id, error = %e, "Preemption notice failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Undecodable session claim, overwriting");
                }
            }
        }

        let claim = SessionClaim {
            server_id: self.server_id.clone(),
            conn_id: conn_id.clone(),
        };
        let mut heartbeat = Heartbeat::new(
            self.kv.clone(),
            key,
            serde_json::to_vec(&claim)?,
            self.ttl,
        )?;
        heartbeat.start().await?;
        Ok(SessionLease { heartbeat })
    }

    /// Release a claim. Only removes the key if this connection still
    /// holds it (a preempting gateway re-bound the key to its own lease,
    /// so revoking ours no longer touches it).
    pub async fn release(&self, mut lease: SessionLease) {
        lease.heartbeat.stop().await;
    }
}
