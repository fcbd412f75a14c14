//! Write-only fan-out peer.

use serde_json::Value;
use std::sync::Arc;

use super::{Envelope, PAYLOAD_FIELD};
use crate::stream::{Fields, Producer, StreamBus, StreamId};
use crate::Result;

/// Publishes notifications onto one broadcast stream; every reader of that
/// stream sees every notification.
#[derive(Clone)]
pub struct Notifier {
    out: Producer,
}

impl Notifier {
    #[must_use]
    pub fn new(bus: Arc<dyn StreamBus>, stream: impl Into<String>) -> Self {
        Self {
            out: Producer::new(bus, stream),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<StreamId> {
        let envelope = Envelope::Notification {
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut fields = Fields::new();
        fields.insert(PAYLOAD_FIELD.to_string(), payload);
        self.out.add(fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Consumer, ConsumerMode, MemoryBus};

    #[tokio::test]
    async fn test_every_broadcast_reader_sees_notifications() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let notifier = Notifier::new(bus.clone(), "fanout");

        let c1 = Consumer::new(bus.clone(), "fanout", ConsumerMode::Broadcast);
        let c2 = Consumer::new(bus.clone(), "fanout", ConsumerMode::Broadcast);
        let mut rx1 = c1.open().await.unwrap();
        let mut rx2 = c2.open().await.unwrap();

        notifier
            .notify("roomStatus", serde_json::json!({"roomId": "room123"}))
            .await
            .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let delivery = rx.recv().await.unwrap();
            let envelope: Envelope =
                serde_json::from_str(&delivery.message.fields[super::PAYLOAD_FIELD]).unwrap();
            match envelope {
                Envelope::Notification { method, params } => {
                    assert_eq!(method, "roomStatus");
                    assert_eq!(params["roomId"], "room123");
                }
                other => panic!("unexpected envelope: {other:?}"),
            }
        }

        c1.close().await;
        c2.close().await;
    }
}
