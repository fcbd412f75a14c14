//! Coalescing keyed timer dispatcher.
//!
//! A single driver task owns a [`Zset`] of `key -> fire-at` deadlines and
//! emits keys on the fired channel once their deadline passes. Re-enqueues
//! coalesce: the earlier deadline wins. All handle operations go through a
//! bounded mailbox, so callers may suspend when the driver is saturated.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::zset::Zset;

/// Mailbox capacity for control commands.
const MAILBOX_CAPACITY: usize = 64;

/// Capacity of the fired-key channel.
const FIRED_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Enqueue {
        key: String,
        delay: Duration,
    },
    Cancel {
        key: String,
    },
    Clear,
    Len {
        reply: tokio::sync::oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Cloneable handle to the scheduler driver.
#[derive(Debug, Clone)]
pub struct KeyedScheduler {
    tx: mpsc::Sender<Command>,
}

impl KeyedScheduler {
    /// Spawn the driver task. Returns the handle and the fired-key stream;
    /// the stream closes on shutdown.
    #[must_use]
    pub fn spawn() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (fired_tx, fired_rx) = mpsc::channel(FIRED_CAPACITY);
        tokio::spawn(run_driver(rx, fired_tx));
        (Self { tx }, fired_rx)
    }

    /// Schedule `key` at `now + delay`. If the key is already scheduled
    /// with an earlier-or-equal deadline the request is dropped; otherwise
    /// the earlier deadline replaces the existing one.
    pub async fn enqueue(&self, key: impl Into<String>, delay: Duration) {
        self.send(Command::Enqueue {
            key: key.into(),
            delay,
        })
        .await;
    }

    pub async fn cancel(&self, key: impl Into<String>) {
        self.send(Command::Cancel { key: key.into() }).await;
    }

    pub async fn clear(&self) {
        self.send(Command::Clear).await;
    }

    /// Number of keys currently scheduled. Zero after shutdown.
    pub async fn len(&self) -> usize {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(Command::Len { reply: tx }).await;
        rx.await.unwrap_or(0)
    }

    /// Idempotent; closes the fired channel. Later commands are accepted
    /// and ignored.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("Scheduler driver gone, command ignored");
        }
    }
}

async fn run_driver(mut rx: mpsc::Receiver<Command>, fired_tx: mpsc::Sender<String>) {
    let mut deadlines: Zset<()> = Zset::new();

    loop {
        let head = deadlines.peek().map(|(_, (), ts)| ts);

        tokio::select! {
            cmd = rx.recv() => match cmd {
                None | Some(Command::Shutdown) => break,
                Some(Command::Enqueue { key, delay }) => {
                    let deadline = Instant::now() + delay;
                    match deadlines.get_ts(&key) {
                        Some(existing) if existing <= deadline => {}
                        _ => deadlines.put(key, (), deadline),
                    }
                }
                Some(Command::Cancel { key }) => {
                    deadlines.remove(&key);
                }
                Some(Command::Clear) => deadlines.clear(),
                Some(Command::Len { reply }) => {
                    let _ = reply.send(deadlines.len());
                }
            },
            () = sleep_until_head(head), if head.is_some() => {
                for entry in deadlines.pop_before(Instant::now(), usize::MAX) {
                    if fired_tx.send(entry.key).await.is_err() {
                        // Receiver gone; nothing left to fire into.
                        return;
                    }
                }
            }
        }
    }
    // Dropping fired_tx closes the fired channel.
}

async fn sleep_until_head(head: Option<Instant>) {
    match head {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
