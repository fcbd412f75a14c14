//! Notification bridge: bus streams → local sockets.
//!
//! Follows the room-status broadcast stream and relays each
//! `broadcastRoomStatus` into a `roomStatus` frame for the room's local
//! connections, and follows the gateway control stream to close
//! connections preempted from another gateway.

use serde_json::Value;
use std::sync::Arc;

use aircast_bus::{Consumer, ConsumerMode, Envelope, StreamBus};
use aircast_core::models::RoomId;
use aircast_core::Result;

use crate::guard::{SessionPreempted, SESSION_PREEMPTED};
use crate::hub::ClientHub;

/// Method name delivered to WebSocket clients.
const ROOM_STATUS: &str = "roomStatus";

pub struct NotifyBridge {
    status_consumer: Consumer,
    control_consumer: Consumer,
}

impl NotifyBridge {
    /// Start following both broadcast streams.
    pub async fn start(
        bus: Arc<dyn StreamBus>,
        hub: Arc<ClientHub>,
        server_id: String,
        status_stream: &str,
        control_stream: &str,
    ) -> Result<Self> {
        let status_consumer = Consumer::new(bus.clone(), status_stream, ConsumerMode::Broadcast);
        let mut status_rx = status_consumer
            .open()
            .await
            .map_err(|e| aircast_core::Error::Store(e.to_string()))?;
        {
            let hub = hub.clone();
            tokio::spawn(async move {
                while let Some(delivery) = status_rx.recv().await {
                    if let Some((method, params)) = decode(&delivery.message.fields) {
                        handle_room_status(&hub, &method, params);
                    }
                }
            });
        }

        let control_consumer = Consumer::new(bus, control_stream, ConsumerMode::Broadcast);
        let mut control_rx = control_consumer
            .open()
            .await
            .map_err(|e| aircast_core::Error::Store(e.to_string()))?;
        tokio::spawn(async move {
            while let Some(delivery) = control_rx.recv().await {
                if let Some((method, params)) = decode(&delivery.message.fields) {
                    handle_control(&hub, &server_id, &method, params);
                }
            }
        });

        Ok(Self {
            status_consumer,
            control_consumer,
        })
    }

    pub async fn stop(&self) {
        self.status_consumer.close().await;
        self.control_consumer.close().await;
    }
}

fn decode(fields: &aircast_bus::Fields) -> Option<(String, Value)> {
    let payload = fields.get("payload")?;
    match serde_json::from_str::<Envelope>(payload) {
        Ok(Envelope::Notification { method, params }) => Some((method, params)),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable notification payload");
            None
        }
    }
}

fn handle_room_status(hub: &ClientHub, method: &str, params: Value) {
    if method != "broadcastRoomStatus" {
        return;
    }
    let Some(room_id) = params.get("roomId").and_then(Value::as_str) else {
        tracing::warn!("Room-status notification without roomId");
        return;
    };
    let room_id = RoomId::from(room_id);

    let frame = match serde_json::to_string(&Envelope::Notification {
        method: ROOM_STATUS.to_string(),
        params,
    }) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize roomStatus frame");
            return;
        }
    };
    let sent = hub.notify_room(&room_id, &frame);
    tracing::debug!(room_id = %room_id, local_connections = sent, "Relayed room status");
}

fn handle_control(hub: &ClientHub, server_id: &str, method: &str, params: Value) {
    if method != SESSION_PREEMPTED {
        return;
    }
    match serde_json::from_value::<SessionPreempted>(params) {
        Ok(notice) if notice.server_id == server_id => {
            tracing::info!(
                user_id = %notice.user_id,
                conn_id = %notice.conn_id,
                "Session preempted from another gateway, dropping connection"
            );
            hub.remove_client(&notice.conn_id);
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable preemption notice");
        }
    }
}
