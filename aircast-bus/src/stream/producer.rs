//! Stream producer.

use std::sync::Arc;

use super::{Fields, StreamBus, StreamId};
use crate::Result;

/// Appends messages to one stream.
#[derive(Clone)]
pub struct Producer {
    bus: Arc<dyn StreamBus>,
    stream: String,
}

impl Producer {
    #[must_use]
    pub fn new(bus: Arc<dyn StreamBus>, stream: impl Into<String>) -> Self {
        Self {
            bus,
            stream: stream.into(),
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append with an auto-generated monotonic ID.
    pub async fn add(&self, fields: Fields) -> Result<StreamId> {
        self.bus.add(&self.stream, None, fields).await
    }

    /// Append with a caller-chosen ID; fails unless strictly greater than
    /// the stream's last ID.
    pub async fn add_with_id(&self, id: StreamId, fields: Fields) -> Result<StreamId> {
        self.bus.add(&self.stream, Some(id), fields).await
    }
}
