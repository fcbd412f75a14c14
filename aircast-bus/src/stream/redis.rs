//! Redis-backed stream bus.
//!
//! Maps the [`StreamBus`] contract onto Redis streams (XADD / XREAD /
//! XREADGROUP / XACK / XTRIM). A single multiplexed connection is cached
//! and reused; every command carries a timeout.
//!
//! Redis has no acked-aware XTRIM, so `acked_only` trims compute the
//! safe boundary from the per-group pending floors first and never trim
//! past it.

use redis::streams::{
    StreamId as RedisStreamId, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::time::timeout;

use super::{Fields, StreamBus, StreamId, StreamMessage};
use crate::{Error, Result};

/// Timeout for non-blocking Redis operations.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra headroom on top of a blocking read's own deadline.
const BLOCK_MARGIN: Duration = Duration::from_secs(2);

pub struct RedisBus {
    client: Client,
    conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisBus {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Bus(format!("Failed to create Redis client: {e}")))?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// Get or create the cached multiplexed connection. The connection
    /// handles concurrent requests and reconnects internally.
    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(ref conn) = *guard {
            return Ok(conn.clone());
        }
        let conn = timeout(OP_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("Redis connection failed: {e}")))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn convert_reply(reply: StreamReadReply) -> Result<Vec<StreamMessage>> {
        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                messages.push(Self::convert_entry(entry)?);
            }
        }
        Ok(messages)
    }

    fn convert_entry(entry: RedisStreamId) -> Result<StreamMessage> {
        let id: StreamId = entry.id.parse()?;
        let mut fields = Fields::new();
        for (field, value) in entry.map {
            let text: String = redis::from_redis_value(value)
                .map_err(|e| Error::Bus(format!("Non-string stream field {field}: {e}")))?;
            fields.insert(field, text);
        }
        Ok(StreamMessage { id, fields })
    }

    /// Smallest pending ID across all of the stream's groups.
    async fn pending_floor(&self, stream: &str) -> Result<Option<StreamId>> {
        let mut conn = self.get_conn().await?;
        let mut xinfo_cmd = redis::cmd("XINFO");
        xinfo_cmd.arg("GROUPS").arg(stream);
        let groups: Vec<std::collections::HashMap<String, redis::Value>> =
            match timeout(OP_TIMEOUT, xinfo_cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("XINFO GROUPS timed out".to_string()))?
            {
                Ok(groups) => groups,
                // Stream (or groups) may not exist yet
                Err(_) => return Ok(None),
            };

        let mut floor: Option<StreamId> = None;
        for info in groups {
            let Some(name_value) = info.get("name") else {
                continue;
            };
            let group: String = redis::from_redis_value(name_value.clone())
                .map_err(|e| Error::Bus(format!("Bad group name: {e}")))?;
            let reply: StreamPendingReply = timeout(OP_TIMEOUT, conn.xpending(stream, &group))
                .await
                .map_err(|_| Error::Timeout("XPENDING timed out".to_string()))?
                .map_err(|e| Error::Bus(format!("XPENDING failed: {e}")))?;
            if let StreamPendingReply::Data(data) = reply {
                let min: StreamId = data.start_id.parse()?;
                floor = Some(floor.map_or(min, |f| f.min(min)));
            }
        }
        Ok(floor)
    }

    async fn trim_to_min_id(&self, stream: &str, boundary: StreamId) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream).arg("MINID").arg(boundary.to_string());
        let removed: u64 = timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("XTRIM timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XTRIM failed: {e}")))?;
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl StreamBus for RedisBus {
    async fn add(&self, stream: &str, id: Option<StreamId>, fields: Fields) -> Result<StreamId> {
        let mut conn = self.get_conn().await?;
        let id_arg = id.map_or_else(|| "*".to_string(), |id| id.to_string());
        let items: Vec<(String, String)> = fields.into_iter().collect();

        let result: std::result::Result<String, redis::RedisError> =
            timeout(OP_TIMEOUT, conn.xadd(stream, id_arg, &items))
                .await
                .map_err(|_| Error::Timeout("XADD timed out".to_string()))?;

        match result {
            Ok(assigned) => assigned.parse(),
            Err(e) => {
                // Redis rejects non-increasing explicit IDs with a
                // dedicated error message.
                let text = e.to_string();
                if let Some(candidate) = id {
                    if text.contains("equal or smaller") {
                        return Err(Error::IdNotIncreasing {
                            candidate: candidate.to_string(),
                            last: "unknown".to_string(),
                        });
                    }
                }
                Err(Error::Bus(format!("XADD failed: {e}")))
            }
        }
    }

    async fn read(
        &self,
        stream: &str,
        after: StreamId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.get_conn().await?;
        let mut options = StreamReadOptions::default().count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        let op_timeout = block.map_or(OP_TIMEOUT, |b| b + BLOCK_MARGIN);

        let reply: StreamReadReply = timeout(
            op_timeout,
            conn.xread_options(&[stream], &[after.to_string()], &options),
        )
        .await
        .map_err(|_| Error::Timeout("XREAD timed out".to_string()))?
        .map_err(|e| Error::Bus(format!("XREAD failed: {e}")))?;

        Self::convert_reply(reply)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("$").arg("MKSTREAM");
        let result: std::result::Result<String, redis::RedisError> =
            timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
                .await
                .map_err(|_| Error::Timeout("XGROUP CREATE timed out".to_string()))?;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::Bus(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        pending: bool,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.get_conn().await?;
        let mut options = StreamReadOptions::default()
            .count(count)
            .group(group, consumer);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        let op_timeout = block.map_or(OP_TIMEOUT, |b| b + BLOCK_MARGIN);
        let start = if pending { "0" } else { ">" };

        let reply: StreamReadReply = timeout(
            op_timeout,
            conn.xread_options(&[stream], &[start], &options),
        )
        .await
        .map_err(|_| Error::Timeout("XREADGROUP timed out".to_string()))?
        .map_err(|e| {
            if e.to_string().contains("NOGROUP") {
                Error::UnknownGroup(group.to_string())
            } else {
                Error::Bus(format!("XREADGROUP failed: {e}"))
            }
        })?;

        Self::convert_reply(reply)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_conn().await?;
        let id_args: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let acked: u64 = timeout(OP_TIMEOUT, conn.xack(stream, group, &id_args))
            .await
            .map_err(|_| Error::Timeout("XACK timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XACK failed: {e}")))?;
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let reply: StreamPendingReply = timeout(OP_TIMEOUT, conn.xpending(stream, group))
            .await
            .map_err(|_| Error::Timeout("XPENDING timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XPENDING failed: {e}")))?;
        Ok(match reply {
            StreamPendingReply::Data(data) => data.count as u64,
            StreamPendingReply::Empty => 0,
            _ => 0,
        })
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("DELCONSUMER").arg(stream).arg(group).arg(consumer);
        let _removed: u64 = timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("XGROUP DELCONSUMER timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XGROUP DELCONSUMER failed: {e}")))?;
        Ok(())
    }

    async fn trim_min_id(&self, stream: &str, min_id: StreamId, acked_only: bool) -> Result<u64> {
        let boundary = if acked_only {
            match self.pending_floor(stream).await? {
                Some(floor) => min_id.min(floor),
                None => min_id,
            }
        } else {
            min_id
        };
        self.trim_to_min_id(stream, boundary).await
    }

    async fn trim_max_len(&self, stream: &str, max_len: u64, acked_only: bool) -> Result<u64> {
        if !acked_only {
            let mut conn = self.get_conn().await?;
            let removed: u64 = timeout(
                OP_TIMEOUT,
                conn.xtrim(stream, redis::streams::StreamMaxlen::Equals(max_len as usize)),
            )
            .await
            .map_err(|_| Error::Timeout("XTRIM timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XTRIM failed: {e}")))?;
            return Ok(removed);
        }

        // Acked-aware cap: find the ID of the first entry we must keep for
        // length reasons, clamp it to the pending floor, then MINID-trim.
        let len = self.len(stream).await?;
        if len <= max_len {
            return Ok(0);
        }
        let excess = (len - max_len) as usize;

        let mut conn = self.get_conn().await?;
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg("-").arg("+").arg("COUNT").arg(excess);
        let range: StreamRangeReply = timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("XRANGE timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XRANGE failed: {e}")))?;

        let Some(last_removable) = range.ids.last() else {
            return Ok(0);
        };
        let mut boundary: StreamId = last_removable.id.parse::<StreamId>()?.next();
        if let Some(floor) = self.pending_floor(stream).await? {
            boundary = boundary.min(floor);
        }
        self.trim_to_min_id(stream, boundary).await
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = timeout(OP_TIMEOUT, conn.xlen(stream))
            .await
            .map_err(|_| Error::Timeout("XLEN timed out".to_string()))?
            .map_err(|e| Error::Bus(format!("XLEN failed: {e}")))?;
        Ok(len)
    }
}
