//! Bidirectional RPC peer.

use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Envelope, RpcError, PAYLOAD_FIELD};
use crate::stream::{Consumer, ConsumerMode, Delivery, Fields, Producer, StreamBus};
use crate::{Error, Result};

type HandlerResult = std::result::Result<Value, RpcError>;
type BoxFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type SyncHandler = Arc<dyn Fn(Value) -> BoxFuture + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Value, Reply) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Deferred reply handle for async handlers. Sending the reply also acks
/// the underlying message; a dropped `Reply` leaves it pending for
/// redelivery.
pub struct Reply {
    out: Producer,
    request_id: String,
    delivery: Delivery,
}

impl Reply {
    pub async fn send(self, result: HandlerResult) {
        // Notifications carry no correlation id; just ack.
        if self.request_id.is_empty() {
            if let Err(e) = self.delivery.ack().await {
                tracing::warn!(error = %e, "Failed to ack notification");
            }
            return;
        }
        let envelope = match result {
            Ok(value) => Envelope::Response {
                id: self.request_id.clone(),
                result: Some(value),
                error: None,
            },
            Err(error) => Envelope::Response {
                id: self.request_id.clone(),
                result: None,
                error: Some(error),
            },
        };
        if let Err(e) = send_envelope(&self.out, &envelope).await {
            tracing::warn!(request_id = %self.request_id, error = %e, "Failed to send reply");
            return;
        }
        if let Err(e) = self.delivery.ack().await {
            tracing::warn!(request_id = %self.request_id, error = %e, "Failed to ack request");
        }
    }
}

async fn send_envelope(out: &Producer, envelope: &Envelope) -> Result<()> {
    let payload = serde_json::to_string(envelope)?;
    let mut fields = Fields::new();
    fields.insert(PAYLOAD_FIELD.to_string(), payload);
    out.add(fields).await?;
    Ok(())
}

/// Bidirectional JSON-RPC peer over an (out, in) stream pair.
pub struct Peer {
    out: Producer,
    consumer: Arc<Consumer>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    pending: Arc<DashMap<String, oneshot::Sender<HandlerResult>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    #[must_use]
    pub fn new(
        bus: Arc<dyn StreamBus>,
        out_stream: impl Into<String>,
        in_stream: impl Into<String>,
        mode: ConsumerMode,
    ) -> Self {
        Self {
            out: Producer::new(bus.clone(), out_stream),
            consumer: Arc::new(Consumer::new(bus, in_stream, mode)),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a synchronous handler: its return value is the reply.
    pub fn def<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: SyncHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.handlers
            .lock()
            .insert(method.into(), Handler::Sync(wrapped));
    }

    /// Register an asynchronous handler replying through [`Reply`].
    pub fn def_async<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value, Reply) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(method.into(), Handler::Async(Arc::new(handler)));
    }

    /// Start the dispatch loop over the in-stream.
    pub async fn open(&self) -> Result<()> {
        let mut deliveries = self.consumer.open().await?;
        let out = self.out.clone();
        let handlers = self.handlers.clone();
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    () = cancel.cancelled() => return,
                    delivery = deliveries.recv() => match delivery {
                        Some(d) => d,
                        None => return,
                    },
                };
                dispatch(&out, &handlers, &pending, delivery).await;
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Invoke a remote method and await its reply.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = nanoid!(16);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let envelope = Envelope::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(e) = send_envelope(&self.out, &envelope).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(Error::Rpc {
                code: error.code,
                message: error.message,
            }),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::CallTimeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget notification on the out-stream.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        send_envelope(
            &self.out,
            &Envelope::Notification {
                method: method.to_string(),
                params,
            },
        )
        .await
    }

    /// Remove this peer's consumer identity from its group.
    pub async fn delete_consumer(&self) -> Result<()> {
        self.consumer.delete_consumer().await
    }

    /// Stop the dispatch loop. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.consumer.close().await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn dispatch(
    out: &Producer,
    handlers: &Arc<Mutex<HashMap<String, Handler>>>,
    pending: &Arc<DashMap<String, oneshot::Sender<HandlerResult>>>,
    delivery: Delivery,
) {
    let Some(payload) = delivery.message.fields.get(PAYLOAD_FIELD) else {
        tracing::warn!(id = %delivery.message.id, "Message without payload field");
        let _ = delivery.ack().await;
        return;
    };
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(id = %delivery.message.id, error = %e, "Undecodable RPC envelope");
            let _ = delivery.ack().await;
            return;
        }
    };

    match envelope {
        Envelope::Response { id, result, error } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let outcome = match (result, error) {
                    (_, Some(error)) => Err(error),
                    (Some(value), None) => Ok(value),
                    (None, None) => Ok(Value::Null),
                };
                let _ = tx.send(outcome);
            }
            let _ = delivery.ack().await;
        }
        Envelope::Request { id, method, params } => {
            let handler = handlers.lock().get(&method).cloned();
            let reply = Reply {
                out: out.clone(),
                request_id: id,
                delivery,
            };
            match handler {
                None => {
                    tracing::warn!(method = %method, "No handler for method");
                    reply.send(Err(RpcError::method_not_found(&method))).await;
                }
                Some(Handler::Sync(f)) => {
                    tokio::spawn(async move {
                        let result = f(params).await;
                        reply.send(result).await;
                    });
                }
                Some(Handler::Async(f)) => f(params, reply),
            }
        }
        Envelope::Notification { method, params } => {
            let handler = handlers.lock().get(&method).cloned();
            match handler {
                None => {
                    tracing::debug!(method = %method, "No handler for notification");
                    let _ = delivery.ack().await;
                }
                Some(Handler::Sync(f)) => {
                    tokio::spawn(async move {
                        if let Err(e) = f(params).await {
                            tracing::warn!(method = %method, code = e.code, error = %e.message, "Notification handler failed");
                        }
                        let _ = delivery.ack().await;
                    });
                }
                Some(Handler::Async(f)) => {
                    // Notifications have no reply path; hand over a reply
                    // that acks without producing a response.
                    let reply = Reply {
                        out: out.clone(),
                        request_id: String::new(),
                        delivery,
                    };
                    f(params, reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse_params;
    use super::*;
    use crate::stream::MemoryBus;

    fn pair(bus: &Arc<dyn StreamBus>) -> (Peer, Peer) {
        // a sends on "ab", receives on "ba"; b is wired crosswise.
        let a = Peer::new(
            bus.clone(),
            "ab",
            "ba",
            ConsumerMode::Group {
                group: "ga".to_string(),
                consumer: "a".to_string(),
            },
        );
        let b = Peer::new(
            bus.clone(),
            "ba",
            "ab",
            ConsumerMode::Group {
                group: "gb".to_string(),
                consumer: "b".to_string(),
            },
        );
        (a, b)
    }

    #[tokio::test]
    async fn test_sync_call_round_trip() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let (a, b) = pair(&bus);

        b.def("echo", |params| async move { Ok(params) });
        b.open().await.unwrap();
        a.open().await.unwrap();

        let result = a
            .call("echo", serde_json::json!({"x": 1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["x"], 1);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_async_handler_reply() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let (a, b) = pair(&bus);

        b.def_async("slow", |params, reply| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                reply.send(Ok(params)).await;
            });
        });
        b.open().await.unwrap();
        a.open().await.unwrap();

        let result = a
            .call("slow", serde_json::json!("hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, "hello");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_rpc_error() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let (a, b) = pair(&bus);
        b.open().await.unwrap();
        a.open().await.unwrap();

        let err = a
            .call("missing", Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rpc {
                code: RpcError::METHOD_NOT_FOUND,
                ..
            }
        ));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let (a, b) = pair(&bus);

        #[derive(serde::Deserialize)]
        struct Params {
            #[allow(dead_code)]
            required: String,
        }
        b.def("strict", |params| async move {
            let _parsed: Params = parse_params(params)?;
            Ok(Value::Null)
        });
        b.open().await.unwrap();
        a.open().await.unwrap();

        let err = a
            .call("strict", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rpc {
                code: RpcError::INVALID_PARAMS,
                ..
            }
        ));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let (a, b) = pair(&bus);

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        b.def("event", move |params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(params).await;
                Ok(Value::Null)
            }
        });
        b.open().await.unwrap();
        a.open().await.unwrap();

        a.notify("event", serde_json::json!({"n": 7})).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received["n"], 7);

        a.close().await;
        b.close().await;
    }
}
