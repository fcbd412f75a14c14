//! Local WebSocket client map.
//!
//! One mutex guards all three maps; mutations and notification fan-out
//! both take it. A send failure is logged and the connection is left
//! alone: the WebSocket layer owns liveness.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

use aircast_core::models::{ConnectionId, RoomId, UserId};

/// Capacity of each connection's outbound message queue.
const SEND_QUEUE_CAPACITY: usize = 64;

/// Serialized frames queued for one socket's writer task.
pub type FrameSender = mpsc::Sender<String>;

struct ClientEntry {
    room_id: RoomId,
    user_id: UserId,
    sender: FrameSender,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<ConnectionId, ClientEntry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct ClientHub {
    inner: Mutex<HubInner>,
}

impl ClientHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns the receiver its writer task drains.
    pub fn add_client(
        &self,
        conn_id: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let mut inner = self.inner.lock();
        inner.clients.insert(
            conn_id.clone(),
            ClientEntry {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                sender: tx,
            },
        );
        inner.rooms.entry(room_id.clone()).or_default().insert(conn_id.clone());
        tracing::info!(conn_id = %conn_id, room_id = %room_id, user_id = %user_id, "Client added");
        rx
    }

    /// Drop a connection, collapsing its room when it empties.
    pub fn remove_client(&self, conn_id: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.clients.remove(conn_id) else {
            return;
        };
        if let Some(conns) = inner.rooms.get_mut(&entry.room_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                inner.rooms.remove(&entry.room_id);
            }
        }
        tracing::info!(conn_id = %conn_id, room_id = %entry.room_id, "Client removed");
    }

    /// Drop every connection of a room at once.
    pub fn remove_room(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        let mut inner = self.inner.lock();
        let Some(conns) = inner.rooms.remove(room_id) else {
            return Vec::new();
        };
        for conn_id in &conns {
            inner.clients.remove(conn_id);
        }
        tracing::info!(room_id = %room_id, connections = conns.len(), "Room removed");
        conns.into_iter().collect()
    }

    /// Queue a `roomStatus` notification frame on every local connection
    /// in the room. Returns how many sends were queued.
    pub fn notify_room(&self, room_id: &RoomId, frame: &str) -> usize {
        let inner = self.inner.lock();
        let Some(conns) = inner.rooms.get(room_id) else {
            return 0;
        };
        let mut sent = 0;
        for conn_id in conns {
            let Some(entry) = inner.clients.get(conn_id) else {
                continue;
            };
            match entry.sender.try_send(frame.to_string()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Not this path's job to tear the connection down
                    tracing::warn!(conn_id = %conn_id, room_id = %room_id, error = %e, "Notification send failed");
                }
            }
        }
        sent
    }

    /// Sender for one connection's frame queue.
    #[must_use]
    pub fn sender(&self, conn_id: &str) -> Option<FrameSender> {
        self.inner
            .lock()
            .clients
            .get(conn_id)
            .map(|entry| entry.sender.clone())
    }

    /// Connection IDs a user currently holds on this gateway.
    #[must_use]
    pub fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        let inner = self.inner.lock();
        inner
            .clients
            .iter()
            .filter(|(_, entry)| &entry.user_id == user_id)
            .map(|(conn_id, _)| conn_id.clone())
            .collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(conn: &str, room: &str, user: &str) -> (ConnectionId, RoomId, UserId) {
        (conn.to_string(), RoomId::from(room), UserId::from(user))
    }

    #[tokio::test]
    async fn test_notify_reaches_only_room_members() {
        let hub = ClientHub::new();
        let (c1, r1, u1) = ids("c1", "room1", "u1");
        let (c2, _, u2) = ids("c2", "room1", "u2");
        let (c3, r2, u3) = ids("c3", "room2", "u3");

        let mut rx1 = hub.add_client(c1, r1.clone(), u1);
        let mut rx2 = hub.add_client(c2, r1.clone(), u2);
        let mut rx3 = hub.add_client(c3, r2, u3);

        let sent = hub.notify_room(&r1, "frame");
        assert_eq!(sent, 2);
        assert_eq!(rx1.recv().await.unwrap(), "frame");
        assert_eq!(rx2.recv().await.unwrap(), "frame");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_client_collapses_empty_room() {
        let hub = ClientHub::new();
        let (c1, r1, u1) = ids("c1", "room1", "u1");
        let _rx = hub.add_client(c1.clone(), r1.clone(), u1);

        hub.remove_client(&c1);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.notify_room(&r1, "frame"), 0);
        // Removing twice is harmless
        hub.remove_client(&c1);
    }

    #[tokio::test]
    async fn test_remove_room_drops_all_connections() {
        let hub = ClientHub::new();
        for i in 0..3 {
            let (c, r, u) = ids(&format!("c{i}"), "room1", &format!("u{i}"));
            let _ = hub.add_client(c, r, u);
        }
        let dropped = hub.remove_room(&RoomId::from("room1"));
        assert_eq!(dropped.len(), 3);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_remove_client() {
        let hub = ClientHub::new();
        let (c1, r1, u1) = ids("c1", "room1", "u1");
        let _rx = hub.add_client(c1, r1.clone(), u1);

        for _ in 0..SEND_QUEUE_CAPACITY + 10 {
            hub.notify_room(&r1, "frame");
        }
        // Still registered despite dropped sends
        assert_eq!(hub.client_count(), 1);
    }
}
