//! Admission relay: a WebSocket server that gates connections and relays
//! opaque frames between peers of the same room.
//!
//! Architecture:
//! ```text
//! TCP accept ──► upgrade callback ──► Gatekeeper::admit
//!                    │  reject: 429 / 403 / 401, connection closed
//!                    ▼  accept
//!               RoomManager::join(room)
//!                    │
//!  Client A ──┐      ▼
//!             ├── BroadcastGroup(room) ──► Client B, Client C …
//!  Client B ──┘   (frames tagged with sender, never decoded)
//! ```
//!
//! The relay holds no document state. A room exists while at least one peer
//! is connected to it. A peer that falls more than `broadcast_capacity` frames
//! behind is disconnected, since the frames it missed cannot be replayed; it
//! reconnects and catches up through a fresh sync handshake. A background task sweeps expired rate buckets once per
//! rate-limit window.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::admission::{AdmissionRequest, Gatekeeper, RateLimiter};
use crate::broadcast::{PeerConnection, RoomManager};
use crate::config::RelayConfig;

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    frames: AtomicU64,
}

struct Shared {
    gate: Gatekeeper,
    rooms: RoomManager,
    counters: Counters,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Bind the listening socket. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let gate = Gatekeeper::new(
            RateLimiter::new(config.rate_limit_window, config.rate_limit_max),
            config.allowed_origins.clone(),
            config.api_key.clone(),
        );
        let shared = Arc::new(Shared {
            gate,
            rooms: RoomManager::new(config.broadcast_capacity),
            counters: Counters::default(),
        });
        Ok(Self {
            config,
            listener,
            shared,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accept connections forever.
    pub async fn run(&self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Open connections are not
    /// drained; their tasks end when the peers disconnect.
    pub async fn run_until<F>(&self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        log::info!(
            "Relay listening on {} (allowed origins: {})",
            self.local_addr()?,
            self.config.allowed_origins.join(", ")
        );

        let sweeper = {
            let shared = self.shared.clone();
            let window = self.config.rate_limit_window.max(std::time::Duration::from_millis(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(window);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    let now = tokio::time::Instant::now().into_std();
                    let removed = shared.gate.limiter().sweep(now);
                    if removed > 0 {
                        log::debug!("Swept {removed} expired rate buckets");
                    }
                }
            })
        };

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(e),
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shared, stream, addr).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Relay shutting down");
                    break Ok(());
                }
            }
        };

        sweeper.abort();
        result
    }

    pub async fn stats(&self) -> RelayStats {
        let c = &self.shared.counters;
        RelayStats {
            connections_accepted: c.accepted.load(Ordering::Relaxed),
            connections_rejected: c.rejected.load(Ordering::Relaxed),
            active_connections: c.active.load(Ordering::Relaxed),
            frames_relayed: c.frames.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

/// Admission happens inside the upgrade callback so a rejected client gets a
/// plain HTTP status instead of an upgraded socket.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), tungstenite::Error> {
    let mut admitted: Option<AdmissionRequest> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let attempt = AdmissionRequest::from_upgrade(req, addr);
        let now = tokio::time::Instant::now().into_std();
        match shared.gate.admit(&attempt, now) {
            Ok(()) => {
                log::info!(
                    "Accepted connection from {} (IP: {}) to room {}",
                    attempt.origin.as_deref().unwrap_or("<none>"),
                    attempt.ip,
                    attempt.room
                );
                admitted = Some(attempt);
                Ok(resp)
            }
            Err(e) => {
                log::info!(
                    "Rejected connection from {} (IP: {}): {e}",
                    attempt.origin.as_deref().unwrap_or("<none>"),
                    attempt.ip
                );
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let mut rejection = ErrorResponse::new(Some(e.reason().to_string()));
                *rejection.status_mut() =
                    StatusCode::from_u16(e.status()).unwrap_or(StatusCode::FORBIDDEN);
                Err(rejection)
            }
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) if admitted.is_none() => {
            log::debug!("Handshake with {addr} ended: {e}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let Some(attempt) = admitted else {
        return Ok(());
    };

    let conn_id = Uuid::new_v4();
    let peer = PeerConnection {
        conn_id,
        ip: attempt.ip_addr().unwrap_or(addr.ip()),
        origin: attempt.origin.clone(),
        connected_at: SystemTime::now(),
    };
    let (room, mut rx) = shared.rooms.join(&attempt.room, peer).await;
    shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
    shared.counters.active.fetch_add(1, Ordering::Relaxed);

    let (mut sink, mut source) = ws.split();
    let result: Result<(), tungstenite::Error> = async {
        loop {
            tokio::select! {
                // Drain the room first so a fast sender never lags on its own frames.
                biased;

                outgoing = rx.recv() => match outgoing {
                    // Not echoed to the sender.
                    Ok((from, _)) if from == conn_id => {}
                    Ok((_, bytes)) => sink.send(Message::Binary(bytes.to_vec().into())).await?,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!(
                            "Peer {} in room {} lagged by {n} frames, disconnecting",
                            attempt.ip,
                            attempt.room
                        );
                        room.record_dropped(n);
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let receivers = room.relay(conn_id, Arc::new(data.to_vec()));
                        shared.counters.frames.fetch_add(1, Ordering::Relaxed);
                        log::trace!(
                            "Relayed {} bytes in room {} to {} receivers",
                            data.len(),
                            attempt.room,
                            receivers.saturating_sub(1)
                        );
                    }
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {}: {e}", attempt.ip);
                        break;
                    }
                },
            }
        }
        Ok(())
    }
    .await;

    shared.rooms.leave(&attempt.room, &conn_id).await;
    shared.counters.active.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection from {} left room {}", attempt.ip, attempt.room);
    result
}
