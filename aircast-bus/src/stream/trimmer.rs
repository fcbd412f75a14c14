//! Stream trimmer.
//!
//! Bounds stream growth by age or length, never discarding entries that
//! are still pending in a consumer group.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{StreamBus, StreamId};
use crate::Result;

#[derive(Clone)]
pub struct Trimmer {
    bus: Arc<dyn StreamBus>,
    stream: String,
}

impl Trimmer {
    #[must_use]
    pub fn new(bus: Arc<dyn StreamBus>, stream: impl Into<String>) -> Self {
        Self {
            bus,
            stream: stream.into(),
        }
    }

    /// Drop acked messages whose ID timestamp is older than `max_age`.
    pub async fn trim_by_time(&self, max_age: Duration) -> Result<u64> {
        let cutoff_ms = StreamId::now_ms().saturating_sub(max_age.as_millis() as u64);
        self.bus
            .trim_min_id(&self.stream, StreamId::new(cutoff_ms, 0), true)
            .await
    }

    /// Cap the acked prefix of the stream at `max_len` messages.
    pub async fn trim_by_max_len(&self, max_len: u64) -> Result<u64> {
        self.bus.trim_max_len(&self.stream, max_len, true).await
    }

    /// Periodic trim loop applying both bounds until cancelled.
    pub async fn run(
        &self,
        interval: Duration,
        max_age: Duration,
        max_len: u64,
        cancel: CancellationToken,
    ) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = timer.tick() => {}
            }
            match self.trim_by_time(max_age).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(stream = %self.stream, removed = removed, "Trimmed by age");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "Age trim failed");
                }
            }
            match self.trim_by_max_len(max_len).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(stream = %self.stream, removed = removed, "Trimmed by length");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "Length trim failed");
                }
            }
        }
    }
}
