//! Broadcast discard janitor.
//!
//! A stopped broadcast stays in the store as `removing` with a discard
//! instant so late observers (the owning mixer, listeners draining their
//! playlists) still see it wind down. The janitor schedules one timer per
//! such room, coalesced on the earliest discard instant, and finalizes
//! the room once it fires: live metadata and any leftover worker
//! assignments are deleted. Rooms that go back onair are unscheduled.

use std::sync::Arc;
use tokio::task::JoinHandle;

use aircast_core::kv::KvStore;
use aircast_core::models::room::subkeys;
use aircast_core::models::{KeyLayout, LiveMeta, LiveStatus, RoomId, RoomState};
use aircast_core::time::KeyedScheduler;

pub struct DiscardJanitor {
    sched: KeyedScheduler,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DiscardJanitor {
    #[must_use]
    pub fn start(kv: Arc<dyn KvStore>, layout: KeyLayout) -> Self {
        let (sched, mut fired) = KeyedScheduler::spawn();
        let task = tokio::spawn(async move {
            while let Some(room_id) = fired.recv().await {
                let room_id = RoomId::from_string(room_id);
                if let Err(e) = finalize(&*kv, &layout, &room_id).await {
                    // The next observed change for the room re-schedules
                    tracing::warn!(room_id = %room_id, error = %e, "Discard failed");
                }
            }
        });
        Self {
            sched,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Track one observed room state: schedule winding-down rooms for
    /// their discard instant, unschedule everything else.
    pub async fn observe(&self, room_id: &str, state: &RoomState) {
        match &state.live {
            Some(live) if live.status == LiveStatus::Removing => {
                let delay = live
                    .discard_at
                    .map(|at| {
                        at.signed_duration_since(chrono::Utc::now())
                            .to_std()
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                self.sched.enqueue(room_id, delay).await;
            }
            _ => self.sched.cancel(room_id).await,
        }
    }

    pub async fn stop(&self) {
        self.sched.shutdown().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Delete the broadcast's remains if it is still winding down at fire
/// time. A room that went back onair in the meantime is left alone.
async fn finalize(kv: &dyn KvStore, layout: &KeyLayout, room_id: &RoomId) -> aircast_core::Result<()> {
    let live_key = layout.room_subkey(room_id, subkeys::LIVEMETA);
    let resp = kv.get(&live_key, false).await?;
    let Some(stored) = resp.kvs.first() else {
        return Ok(());
    };
    let live: LiveMeta = serde_json::from_slice(&stored.value)?;
    if live.status != LiveStatus::Removing {
        return Ok(());
    }

    kv.delete(&live_key, false).await?;
    kv.delete(&layout.room_subkey(room_id, subkeys::MIXER), false)
        .await?;
    kv.delete(&layout.room_subkey(room_id, subkeys::JANUS), false)
        .await?;
    tracing::info!(room_id = %room_id, "Discarded finished broadcast");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_core::kv::MemoryKv;
    use aircast_core::models::ModuleId;
    use std::time::Duration;

    fn live(status: LiveStatus, discard_at: Option<chrono::DateTime<chrono::Utc>>) -> LiveMeta {
        LiveMeta {
            status,
            mixer_id: ModuleId::from("m1"),
            janus_id: ModuleId::from("j1"),
            created_at: chrono::Utc::now(),
            discard_at,
            nonce: "nonce123".to_string(),
        }
    }

    async fn put_live(kv: &MemoryKv, layout: &KeyLayout, room: &RoomId, live: &LiveMeta) {
        kv.put(
            &layout.room_subkey(room, subkeys::LIVEMETA),
            serde_json::to_vec(live).unwrap(),
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_due_removing_room_is_discarded() {
        let kv = MemoryKv::new();
        let layout = KeyLayout::default();
        let room = RoomId::from("room123");

        let meta = live(LiveStatus::Removing, Some(chrono::Utc::now()));
        put_live(&kv, &layout, &room, &meta).await;

        let janitor = DiscardJanitor::start(Arc::new(kv.clone()), layout.clone());
        let state = RoomState {
            live: Some(meta),
            ..Default::default()
        };
        janitor.observe(room.as_str(), &state).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let resp = kv
            .get(&layout.room_subkey(&room, subkeys::LIVEMETA), false)
            .await
            .unwrap();
        assert!(resp.kvs.is_empty());
        janitor.stop().await;
    }

    #[tokio::test]
    async fn test_room_back_onair_is_spared() {
        let kv = MemoryKv::new();
        let layout = KeyLayout::default();
        let room = RoomId::from("room123");

        // Scheduled while removing, but flips back onair before firing
        let removing = live(LiveStatus::Removing, Some(chrono::Utc::now()));
        put_live(&kv, &layout, &room, &removing).await;
        let janitor = DiscardJanitor::start(Arc::new(kv.clone()), layout.clone());

        let onair = live(LiveStatus::Onair, None);
        put_live(&kv, &layout, &room, &onair).await;
        janitor
            .observe(
                room.as_str(),
                &RoomState {
                    live: Some(removing),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Fired, re-checked the store, and left the onair broadcast alone
        let resp = kv
            .get(&layout.room_subkey(&room, subkeys::LIVEMETA), false)
            .await
            .unwrap();
        assert_eq!(resp.kvs.len(), 1);
        janitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_onair_cancels_schedule() {
        let kv = MemoryKv::new();
        let layout = KeyLayout::default();
        let room = RoomId::from("room123");

        let removing = live(
            LiveStatus::Removing,
            Some(chrono::Utc::now() + chrono::Duration::seconds(2)),
        );
        put_live(&kv, &layout, &room, &removing).await;
        let janitor = DiscardJanitor::start(Arc::new(kv.clone()), layout.clone());
        janitor
            .observe(
                room.as_str(),
                &RoomState {
                    live: Some(removing),
                    ..Default::default()
                },
            )
            .await;

        // The broadcast restarts; the pending discard is cancelled
        let onair = live(LiveStatus::Onair, None);
        put_live(&kv, &layout, &room, &onair).await;
        janitor
            .observe(
                room.as_str(),
                &RoomState {
                    live: Some(onair),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(2200)).await;
        let resp = kv
            .get(&layout.room_subkey(&room, subkeys::LIVEMETA), false)
            .await
            .unwrap();
        assert_eq!(resp.kvs.len(), 1);
        janitor.stop().await;
    }
}
