//! Stream consumer.
//!
//! Two shapes. Broadcast: every consumer follows the live tail, skipping
//! history older than a short backfill window. Consumer-group: each message
//! goes to exactly one consumer in the group, and a consumer that reopens
//! drains its delivered-but-unacked entries before rejoining the live tail.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aircast_core::retry::Backoff;

use super::{StreamBus, StreamId, StreamMessage};
use crate::Result;

/// A freshly opened broadcast consumer ignores messages older than this.
const BACKFILL_WINDOW: Duration = Duration::from_secs(3);

/// How long one group read blocks before re-checking cancellation.
const BLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Messages claimed per read.
const READ_BATCH: usize = 100;

/// Capacity of the delivery channel.
const DELIVERY_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub enum ConsumerMode {
    Broadcast,
    Group { group: String, consumer: String },
}

struct AckHandle {
    bus: Arc<dyn StreamBus>,
    stream: String,
    group: String,
}

/// One delivered message with its acknowledgement handle.
pub struct Delivery {
    pub message: StreamMessage,
    acker: Option<Arc<AckHandle>>,
}

impl Delivery {
    /// Acknowledge this message. A no-op for broadcast consumers.
    pub async fn ack(&self) -> Result<()> {
        if let Some(acker) = &self.acker {
            acker
                .bus
                .ack(&acker.stream, &acker.group, &[self.message.id])
                .await?;
        }
        Ok(())
    }
}

pub struct Consumer {
    bus: Arc<dyn StreamBus>,
    stream: String,
    mode: ConsumerMode,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    #[must_use]
    pub fn new(bus: Arc<dyn StreamBus>, stream: impl Into<String>, mode: ConsumerMode) -> Self {
        Self {
            bus,
            stream: stream.into(),
            mode,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Ensure the group exists (group mode) and start the read loop.
    pub async fn open(&self) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);

        if let ConsumerMode::Group { group, .. } = &self.mode {
            self.bus.ensure_group(&self.stream, group).await?;
        }

        let bus = self.bus.clone();
        let stream = self.stream.clone();
        let mode = self.mode.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            match mode {
                ConsumerMode::Broadcast => run_broadcast(bus, stream, tx, cancel).await,
                ConsumerMode::Group { group, consumer } => {
                    run_group(bus, stream, group, consumer, tx, cancel).await;
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(rx)
    }

    /// Stop the read loop. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Remove this consumer's identity from the group, discarding its
    /// pending entries. A no-op in broadcast mode.
    pub async fn delete_consumer(&self) -> Result<()> {
        if let ConsumerMode::Group { group, consumer } = &self.mode {
            self.bus
                .delete_consumer(&self.stream, group, consumer)
                .await?;
        }
        Ok(())
    }
}

async fn run_broadcast(
    bus: Arc<dyn StreamBus>,
    stream: String,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    let backfill_ms = BACKFILL_WINDOW.as_millis() as u64;
    let mut cursor = StreamId::new(StreamId::now_ms().saturating_sub(backfill_ms), 0);
    let mut backoff = Backoff::default();

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = bus.read(&stream, cursor, READ_BATCH, Some(BLOCK_INTERVAL)) => read,
        };
        match read {
            Ok(messages) => {
                backoff.reset();
                for message in messages {
                    cursor = cursor.max(message.id);
                    let delivery = Delivery {
                        message,
                        acker: None,
                    };
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Broadcast read failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff.next_delay()) => {}
                }
            }
        }
    }
}

async fn run_group(
    bus: Arc<dyn StreamBus>,
    stream: String,
    group: String,
    consumer: String,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    let acker = Arc::new(AckHandle {
        bus: bus.clone(),
        stream: stream.clone(),
        group: group.clone(),
    });
    let mut backoff = Backoff::default();

    // Pending mode first: drain entries assigned to this consumer that
    // were never acked, oldest first.
    let mut last_pending = StreamId::ZERO;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match bus
            .read_group(&stream, &group, &consumer, true, READ_BATCH, None)
            .await
        {
            Ok(messages) => {
                backoff.reset();
                // Pending entries stay pending until acked, so advance a
                // local cursor to avoid replaying the same batch.
                let fresh: Vec<StreamMessage> = messages
                    .into_iter()
                    .filter(|m| m.id > last_pending)
                    .collect();
                let Some(newest) = fresh.last().map(|m| m.id) else {
                    break;
                };
                last_pending = newest;
                for message in fresh {
                    let delivery = Delivery {
                        message,
                        acker: Some(acker.clone()),
                    };
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream = %stream, group = %group, error = %e, "Pending drain failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff.next_delay()) => {}
                }
            }
        }
    }

    // Live tail: claim new entries for this consumer.
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = bus.read_group(&stream, &group, &consumer, false, READ_BATCH, Some(BLOCK_INTERVAL)) => read,
        };
        match read {
            Ok(messages) => {
                backoff.reset();
                for message in messages {
                    let delivery = Delivery {
                        message,
                        acker: Some(acker.clone()),
                    };
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream = %stream, group = %group, error = %e, "Group read failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff.next_delay()) => {}
                }
            }
        }
    }
}
