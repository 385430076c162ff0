//! Per-room fan-out of opaque frames to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Every frame
//! is tagged with the connection id that sent it so the relay can skip the
//! echo without decoding the payload.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A relayed frame: sending connection + encoded bytes.
pub type RelayFrame = (Uuid, Arc<Vec<u8>>);

/// An admitted peer connection. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConnection {
    pub conn_id: Uuid,
    pub ip: IpAddr,
    pub origin: Option<String>,
    pub connected_at: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// The relay side of one room. Holds no document state.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayFrame>,
    peers: RwLock<HashMap<Uuid, PeerConnection>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per peer before a lagging peer drops frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub async fn add_peer(&self, peer: PeerConnection) -> broadcast::Receiver<RelayFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(peer.conn_id, peer);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<PeerConnection> {
        self.peers.write().await.remove(conn_id)
    }

    /// Fan a frame out to every subscriber. Lock-free.
    pub fn relay(&self, from: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((from, frame)).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn record_dropped(&self, n: u64) {
        self.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerConnection> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room id → broadcast group. Rooms exist only while they have peers.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join `room`, creating it if needed. Creation and registration happen
    /// under one write lock so a concurrent `leave` cannot remove the room
    /// between the two.
    pub async fn join(
        &self,
        room: &str,
        peer: PeerConnection,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<RelayFrame>) {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                log::debug!("Room {room} created");
                Arc::new(BroadcastGroup::new(self.default_capacity))
            })
            .clone();
        let rx = group.add_peer(peer).await;
        (group, rx)
    }

    /// Remove a peer; drops the room once it is empty. Returns `true` if the room was removed.
    pub async fn leave(&self, room: &str, conn_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room) else {
            return false;
        };
        group.remove_peer(conn_id).await;
        if group.peer_count().await == 0 {
            rooms.remove(room);
            log::debug!("Room {room} removed (empty)");
            return true;
        }
        false
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> PeerConnection {
        PeerConnection {
            conn_id: Uuid::new_v4(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            origin: Some("http://localhost:5173".into()),
            connected_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_tags_sender() {
        let group = BroadcastGroup::new(16);
        let alice = peer();
        let bob = peer();
        let mut rx_a = group.add_peer(alice.clone()).await;
        let mut rx_b = group.add_peer(bob).await;

        let count = group.relay(alice.conn_id, Arc::new(vec![1, 2, 3]));
        // Sender receives too; skipping the echo is the connection's job.
        assert_eq!(count, 2);

        let (from, bytes) = rx_b.recv().await.unwrap();
        assert_eq!(from, alice.conn_id);
        assert_eq!(*bytes, vec![1, 2, 3]);
        assert_eq!(rx_a.recv().await.unwrap().0, alice.conn_id);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let p = peer();
        let _rx = group.add_peer(p.clone()).await;
        group.relay(p.conn_id, Arc::new(vec![0]));
        group.relay(p.conn_id, Arc::new(vec![0]));
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let manager = RoomManager::new(16);
        let a = peer();
        let b = peer();

        let (room1, _rx1) = manager.join("thesis", a.clone()).await;
        let (room2, _rx2) = manager.join("thesis", b.clone()).await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);

        assert!(!manager.leave("thesis", &a.conn_id).await);
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.leave("thesis", &b.conn_id).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("thesis").await.is_none());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = RoomManager::new(16);
        let a = peer();
        let b = peer();
        let (room_a, _rx_a) = manager.join("a", a.clone()).await;
        let (_room_b, mut rx_b) = manager.join("b", b).await;

        room_a.relay(a.conn_id, Arc::new(vec![7]));
        assert!(rx_b.try_recv().is_err());

        let mut rooms = manager.active_rooms().await;
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_lag() {
        let group = BroadcastGroup::new(2);
        let p = peer();
        let mut rx = group.add_peer(p.clone()).await;
        for i in 0..5u8 {
            group.relay(p.conn_id, Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
