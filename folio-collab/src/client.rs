//! WebSocket client for the admission relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect by calling `connect` again)
//! - Frame send/receive over the relay
//! - Offline queue for updates produced while disconnected
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::protocol::{FrameKind, LamportClock, ProtocolError, SyncFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A frame addressed to this peer (or to the whole room).
    Frame(SyncFrame),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://localhost:4444`
    pub relay_url: String,
    pub room: String,
    /// Sent as the `Origin` header
    pub origin: Option<String>,
    /// Sent as the `x-api-key` header
    pub api_key: Option<String>,
    pub offline_queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            room: room.into(),
            origin: None,
            api_key: None,
            offline_queue_capacity: 10_000,
        }
    }

    pub fn room_url(&self) -> String {
        format!("{}/{}", self.relay_url.trim_end_matches('/'), self.room)
    }
}

/// Updates made while disconnected, replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full and the update was not queued.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Payload bytes waiting to be replayed.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, p)| p.len()).sum()
    }
}

/// Relay client for one peer in one room.
pub struct SyncClient {
    peer_id: Uuid,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<Mutex<LamportClock>>,
    offline_queue: Mutex<OfflineQueue>,
    outgoing_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

impl SyncClient {
    pub fn new(peer_id: Uuid, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id,
            offline_queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(Mutex::new(LamportClock::default())),
            outgoing_tx: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver (only the first call returns it).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Connect to `{relay_url}/{room}` and spawn the reader and writer tasks.
    ///
    /// An admission rejection is returned as [`ProtocolError::Rejected`] with
    /// the relay's HTTP status.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<(), ProtocolError> {
        let mut request = self
            .config
            .room_url()
            .into_client_request()
            .map_err(|e| ProtocolError::InvalidUrl(e.to_string()))?;
        if let Some(origin) = &self.config.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| ProtocolError::InvalidUrl(e.to_string()))?;
            request.headers_mut().insert("origin", value);
        }
        if let Some(key) = &self.config.api_key {
            let value =
                HeaderValue::from_str(key).map_err(|e| ProtocolError::InvalidUrl(e.to_string()))?;
            request.headers_mut().insert("x-api-key", value);
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(conn) => conn,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ProtocolError::Rejected(response.status().as_u16()))
            }
            Err(tungstenite::Error::Url(e)) => return Err(ProtocolError::InvalidUrl(e.to_string())),
            Err(e) => return Err(ProtocolError::Connect(e.to_string())),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.outgoing_tx.lock().await = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to relay room {}", self.config.room);
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let (queued, queued_bytes) = {
            let mut queue = self.offline_queue.lock().await;
            let bytes = queue.total_bytes();
            (queue.drain(), bytes)
        };
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates ({queued_bytes} bytes)", queued.len());
            for (clock, payload) in queued {
                let frame = SyncFrame::update(self.peer_id, clock, payload);
                let _ = out_tx.send(frame.encode()?).await;
            }
        }
        drop(out_tx);

        // Reader task: surface frames meant for us, answer pings.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let outgoing = self.outgoing_tx.clone();
        let peer_id = self.peer_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let frame = match SyncFrame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        if !frame.is_for(peer_id) {
                            continue;
                        }
                        clock.lock().await.observe(frame.clock);
                        if frame.kind == FrameKind::Ping {
                            // Borrow the shared sender so disconnect() can still close the writer.
                            let tx = outgoing.lock().await.clone();
                            if let (Some(tx), Ok(pong)) =
                                (tx, SyncFrame::pong(peer_id, frame.peer_id).encode())
                            {
                                let _ = tx.send(pong).await;
                            }
                        }
                        log::trace!("Frame {:?} from {}", frame.kind, frame.peer_id);
                        if event_tx.send(SyncEvent::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *outgoing.lock().await = None;
            *state.write().await = ConnectionState::Disconnected;
            log::info!("Disconnected from relay");
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Queued offline updates are kept.
    pub async fn disconnect(&self) {
        // Dropping the last sender ends the writer task, which closes the socket.
        self.outgoing_tx.lock().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send an incremental update; queued while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.lock().await.tick();
        let frame = SyncFrame::update(self.peer_id, clock, update);
        let encoded = frame.encode()?;
        if self.send_raw(encoded).await.is_err() {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(clock, frame.payload) {
                log::warn!("Offline queue full, dropping update");
                return Err(ProtocolError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Send a handshake or awareness frame. Not queued while disconnected.
    pub async fn send_frame(&self, mut frame: SyncFrame) -> Result<(), ProtocolError> {
        frame.peer_id = self.peer_id;
        if frame.clock == 0 {
            frame.clock = self.clock.lock().await.now();
        }
        self.send_raw(frame.encode()?).await
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn clock(&self) -> u64 {
        self.clock.lock().await.now()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(Uuid::new_v4(), ClientConfig::new("ws://localhost:4444/", "thesis"))
    }

    #[test]
    fn test_room_url() {
        let config = ClientConfig::new("ws://localhost:4444/", "thesis");
        assert_eq!(config.room_url(), "ws://localhost:4444/thesis");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = client();
        client.send_update(vec![1, 2, 3]).await.unwrap();
        client.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.clock().await, 2);
    }

    #[tokio::test]
    async fn test_send_frame_offline_errors() {
        let client = client();
        let frame = SyncFrame::ping(Uuid::nil());
        assert_eq!(client.send_frame(frame).await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = SyncClient::new(
            Uuid::new_v4(),
            ClientConfig::new(format!("ws://127.0.0.1:{port}"), "room"),
        );
        assert!(matches!(client.connect().await, Err(ProtocolError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let client = client();
        assert!(client.take_event_rx().await.is_some());
        assert!(client.take_event_rx().await.is_none());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2, 3]));
        assert!(!queue.enqueue(3, vec![4]));
        assert_eq!(queue.total_bytes(), 3);
        assert_eq!(queue.drain(), vec![(1, vec![1]), (2, vec![2, 3])]);
        assert!(queue.is_empty());
    }
}
