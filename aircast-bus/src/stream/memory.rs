//! In-process stream bus.
//!
//! Full [`StreamBus`] contract against local state: monotonic IDs, consumer
//! groups with pending tracking, acked-aware trimming, and blocking reads.
//! Readers register for wakeups under the same lock that checks for data,
//! so no append can slip between the check and the wait.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{Fields, StreamBus, StreamId, StreamMessage};
use crate::{Error, Result};

struct GroupData {
    cursor: StreamId,
    /// Delivered-but-unacked entries: id -> owning consumer.
    pending: BTreeMap<StreamId, String>,
}

struct StreamData {
    entries: Vec<(StreamId, Fields)>,
    last_id: StreamId,
    groups: HashMap<String, GroupData>,
    version: watch::Sender<u64>,
}

impl Default for StreamData {
    fn default() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: Vec::new(),
            last_id: StreamId::ZERO,
            groups: HashMap::new(),
            version,
        }
    }
}

impl StreamData {
    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn collect_after(&self, after: StreamId, count: usize) -> Vec<StreamMessage> {
        self.entries
            .iter()
            .filter(|(id, _)| *id > after)
            .take(count)
            .map(|(id, fields)| StreamMessage {
                id: *id,
                fields: fields.clone(),
            })
            .collect()
    }

    /// Smallest pending ID across all groups, if any entry is pending.
    fn pending_floor(&self) -> Option<StreamId> {
        self.groups
            .values()
            .filter_map(|g| g.pending.keys().next().copied())
            .min()
    }

    fn is_pending_anywhere(&self, id: StreamId) -> bool {
        self.groups.values().any(|g| g.pending.contains_key(&id))
    }
}

/// Process-local [`StreamBus`] implementation.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<HashMap<String, StreamData>>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<R>(&self, stream: &str, f: impl FnOnce(&mut StreamData) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.entry(stream.to_string()).or_default())
    }

    /// Block until the stream version changes or the deadline passes.
    /// Returns `false` on deadline.
    async fn wait_for_change(
        rx: &mut watch::Receiver<u64>,
        deadline: tokio::time::Instant,
    ) -> bool {
        tokio::time::timeout_at(deadline, rx.changed()).await.is_ok()
    }
}

#[async_trait::async_trait]
impl StreamBus for MemoryBus {
    async fn add(&self, stream: &str, id: Option<StreamId>, fields: Fields) -> Result<StreamId> {
        self.with_stream(stream, |data| {
            let assigned = match id {
                Some(candidate) => {
                    if candidate <= data.last_id {
                        return Err(Error::IdNotIncreasing {
                            candidate: candidate.to_string(),
                            last: data.last_id.to_string(),
                        });
                    }
                    candidate
                }
                None => {
                    let ms = StreamId::now_ms();
                    if ms <= data.last_id.ms {
                        data.last_id.next()
                    } else {
                        StreamId::new(ms, 0)
                    }
                }
            };
            data.entries.push((assigned, fields));
            data.last_id = assigned;
            data.bump();
            Ok(assigned)
        })
    }

    async fn read(
        &self,
        stream: &str,
        after: StreamId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = block.map(|d| tokio::time::Instant::now() + d);
        loop {
            let (msgs, mut rx) = self.with_stream(stream, |data| {
                (data.collect_after(after, count), data.version.subscribe())
            });
            if !msgs.is_empty() {
                return Ok(msgs);
            }
            let Some(deadline) = deadline else {
                return Ok(msgs);
            };
            if !Self::wait_for_change(&mut rx, deadline).await {
                return Ok(Vec::new());
            }
        }
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.with_stream(stream, |data| {
            let tail = data.last_id;
            data.groups.entry(group.to_string()).or_insert(GroupData {
                cursor: tail,
                pending: BTreeMap::new(),
            });
        });
        Ok(())
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
        let deadline = block.map(|d| tokio::time::Instant::now() + d);
        loop {
            let result = self.with_stream(stream, |data| {
                let Some(g) = data.groups.get(group) else {
                    return Err(Error::UnknownGroup(group.to_string()));
                };

                if pending {
                    // Redeliver this consumer's unacked entries, oldest first.
                    let ids: Vec<StreamId> = g
                        .pending
                        .iter()
                        .filter(|(_, owner)| owner.as_str() == consumer)
                        .map(|(id, _)| *id)
                        .take(count)
                        .collect();
                    let msgs = data
                        .entries
                        .iter()
                        .filter(|(id, _)| ids.contains(id))
                        .map(|(id, fields)| StreamMessage {
                            id: *id,
                            fields: fields.clone(),
                        })
                        .collect::<Vec<_>>();
                    return Ok((msgs, data.version.subscribe()));
                }

                let msgs = data.collect_after(g.cursor, count);
                let rx = data.version.subscribe();
                if !msgs.is_empty() {
                    let g = data
                        .groups
                        .get_mut(group)
                        .ok_or_else(|| Error::UnknownGroup(group.to_string()))?;
                    for m in &msgs {
                        g.cursor = g.cursor.max(m.id);
                        g.pending.insert(m.id, consumer.to_string());
                    }
                }
                Ok((msgs, rx))
            });

            let (msgs, mut rx) = result?;
            if !msgs.is_empty() || pending {
                return Ok(msgs);
            }
            let Some(deadline) = deadline else {
                return Ok(msgs);
            };
            if !Self::wait_for_change(&mut rx, deadline).await {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64> {
        self.with_stream(stream, |data| {
            let Some(g) = data.groups.get_mut(group) else {
                return Ok(0);
            };
            let mut acked = 0;
            for id in ids {
                if g.pending.remove(id).is_some() {
                    acked += 1;
                }
            }
            Ok(acked)
        })
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        self.with_stream(stream, |data| {
            Ok(data
                .groups
                .get(group)
                .map(|g| g.pending.len() as u64)
                .unwrap_or(0))
        })
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<()> {
        self.with_stream(stream, |data| {
            if let Some(g) = data.groups.get_mut(group) {
                g.pending.retain(|_, owner| owner.as_str() != consumer);
            }
        });
        Ok(())
    }

    async fn trim_min_id(&self, stream: &str, min_id: StreamId, acked_only: bool) -> Result<u64> {
        self.with_stream(stream, |data| {
            let floor = if acked_only { data.pending_floor() } else { None };
            let before = data.entries.len();
            data.entries.retain(|(id, _)| {
                if *id >= min_id {
                    return true;
                }
                if acked_only {
                    if let Some(floor) = floor {
                        if *id >= floor {
                            return true;
                        }
                    }
                }
                false
            });
            Ok((before - data.entries.len()) as u64)
        })
    }

    async fn trim_max_len(&self, stream: &str, max_len: u64, acked_only: bool) -> Result<u64> {
        self.with_stream(stream, |data| {
            let mut removed = 0u64;
            while data.entries.len() as u64 > max_len {
                let Some((oldest, _)) = data.entries.first() else {
                    break;
                };
                if acked_only && data.is_pending_anywhere(*oldest) {
                    break;
                }
                data.entries.remove(0);
                removed += 1;
            }
            Ok(removed)
        })
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        self.with_stream(stream, |data| Ok(data.entries.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_auto_ids_are_monotonic() {
        let bus = MemoryBus::new();
        let a = bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        let b = bus.add("s", None, fields(&[("n", "2")])).await.unwrap();
        let c = bus.add("s", None, fields(&[("n", "3")])).await.unwrap();
        assert!(a < b && b < c);
        assert_eq!(bus.len("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_explicit_id_must_increase() {
        let bus = MemoryBus::new();
        bus.add("s", Some(StreamId::new(10, 0)), Fields::new())
            .await
            .unwrap();
        assert!(bus
            .add("s", Some(StreamId::new(10, 0)), Fields::new())
            .await
            .is_err());
        assert!(bus
            .add("s", Some(StreamId::new(9, 5)), Fields::new())
            .await
            .is_err());
        bus.add("s", Some(StreamId::new(10, 1)), Fields::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_after_cursor() {
        let bus = MemoryBus::new();
        let a = bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        let b = bus.add("s", None, fields(&[("n", "2")])).await.unwrap();

        let msgs = bus.read("s", StreamId::ZERO, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 2);
        let msgs = bus.read("s", a, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, b);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_add() {
        let bus = MemoryBus::new();
        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.read("s", StreamId::ZERO, 10, Some(Duration::from_secs(5)))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        let msgs = reader.await.unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn test_group_delivers_each_message_once() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        bus.add("s", None, fields(&[("n", "2")])).await.unwrap();

        let first = bus.read_group("s", "g", "c1", false, 1, None).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = bus.read_group("s", "g", "c2", false, 10, None).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_group_created_at_tail_skips_history() {
        let bus = MemoryBus::new();
        bus.add("s", None, fields(&[("n", "old")])).await.unwrap();
        bus.ensure_group("s", "g").await.unwrap();
        bus.add("s", None, fields(&[("n", "new")])).await.unwrap();

        let msgs = bus.read_group("s", "g", "c1", false, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].fields["n"], "new");
    }

    #[tokio::test]
    async fn test_pending_replay_and_ack() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        let id = bus.add("s", None, fields(&[("n", "1")])).await.unwrap();

        let live = bus.read_group("s", "g", "c1", false, 10, None).await.unwrap();
        assert_eq!(live.len(), 1);

        // Unacked: replayed to the same consumer, invisible to others
        let replay = bus.read_group("s", "g", "c1", true, 10, None).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, id);
        let other = bus.read_group("s", "g", "c2", true, 10, None).await.unwrap();
        assert!(other.is_empty());

        bus.ack("s", "g", &[id]).await.unwrap();
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
        let replay = bus.read_group("s", "g", "c1", true, 10, None).await.unwrap();
        assert!(replay.is_empty());
    }

    #[tokio::test]
    async fn test_delete_consumer_discards_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        bus.read_group("s", "g", "c1", false, 10, None).await.unwrap();
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 1);

        bus.delete_consumer("s", "g", "c1").await.unwrap();
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trim_min_id_spares_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        let a = bus.add("s", None, fields(&[("n", "1")])).await.unwrap();
        let b = bus.add("s", None, fields(&[("n", "2")])).await.unwrap();
        bus.read_group("s", "g", "c1", false, 10, None).await.unwrap();
        bus.ack("s", "g", &[a]).await.unwrap();

        // b is still pending; trimming everything only drops a
        let removed = bus.trim_min_id("s", b.next(), true).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(bus.len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trim_max_len() {
        let bus = MemoryBus::new();
        for i in 0..10 {
            bus.add("s", None, fields(&[("n", &i.to_string())]))
                .await
                .unwrap();
        }
        let removed = bus.trim_max_len("s", 4, false).await.unwrap();
        assert_eq!(removed, 6);
        assert_eq!(bus.len("s").await.unwrap(), 4);
        let msgs = bus.read("s", StreamId::ZERO, 100, None).await.unwrap();
        assert_eq!(msgs[0].fields["n"], "6");
    }
}
