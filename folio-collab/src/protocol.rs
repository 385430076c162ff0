//! Binary peer-to-peer protocol carried opaquely through the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┬──────────┐
//! │ kind     │ peer_id   │ to         │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 1-17 bytes │ varint   │ variable │
//! └──────────┴───────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: a joining peer broadcasts `SyncStep1` (its state vector).
//! Every peer answers the sender directly with `SyncStep2` (the diff the
//! sender lacks) followed by its own `SyncStep1`, which the joiner answers
//! with `SyncStep2`. After that, `Update` frames carry incremental changes.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Yrs state vector, asking for missing updates
    SyncStep1 = 1,
    /// Yrs diff answering a state vector
    SyncStep2 = 2,
    /// Incremental Yrs update
    Update = 3,
    /// Encoded `AwarenessMessage`
    Awareness = 4,
    Ping = 5,
    Pong = 6,
}

/// One peer frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    pub kind: FrameKind,
    pub peer_id: Uuid,
    /// Addressee for handshake replies; `None` means the whole room.
    pub to: Option<Uuid>,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncFrame {
    pub fn sync_step1(peer_id: Uuid, to: Option<Uuid>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep1,
            peer_id,
            to,
            clock: 0,
            payload: state_vector,
        }
    }

    pub fn sync_step2(peer_id: Uuid, to: Uuid, diff: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep2,
            peer_id,
            to: Some(to),
            clock: 0,
            payload: diff,
        }
    }

    pub fn update(peer_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Update,
            peer_id,
            to: None,
            clock,
            payload: update,
        }
    }

    pub fn awareness(peer_id: Uuid, clock: u64, message: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Awareness,
            peer_id,
            to: None,
            clock,
            payload: message,
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Ping,
            peer_id,
            to: None,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid, to: Uuid) -> Self {
        Self {
            kind: FrameKind::Pong,
            peer_id,
            to: Some(to),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Whether `peer` should process this frame.
    pub fn is_for(&self, peer: Uuid) -> bool {
        self.peer_id != peer && self.to.is_none_or(|to| to == peer)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Lamport clock for frames sent by one peer.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Merge a received timestamp.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }

    pub fn now(&self) -> u64 {
        self.time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    /// The relay refused the WebSocket upgrade with this HTTP status.
    #[error("connection rejected by relay (HTTP {0})")]
    Rejected(u16),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_frame_roundtrip() {
        let peer = Uuid::new_v4();
        let frame = SyncFrame::update(peer, 42, vec![1, 2, 3]);
        let decoded = SyncFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind, FrameKind::Update);
        assert_eq!(decoded.clock, 42);
    }

    #[test]
    fn test_step2_is_addressed() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        let reply = SyncFrame::sync_step2(a, b, vec![9]);
        assert!(reply.is_for(b));
        assert!(!reply.is_for(c));
        // Never for the sender itself.
        assert!(!reply.is_for(a));
    }

    #[test]
    fn test_broadcast_frame_is_for_everyone_else() {
        let a = Uuid::from_u128(1);
        let frame = SyncFrame::sync_step1(a, None, vec![0]);
        assert!(frame.is_for(Uuid::from_u128(2)));
        assert!(!frame.is_for(a));
    }

    #[test]
    fn test_small_update_overhead() {
        let frame = SyncFrame::update(Uuid::new_v4(), 1, vec![0u8; 50]);
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 100, "encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_lamport_clock() {
        let mut clock = LamportClock::default();
        assert_eq!(clock.tick(), 1);
        clock.observe(10);
        assert_eq!(clock.tick(), 11);
        clock.observe(3);
        assert_eq!(clock.now(), 11);
    }

    #[test]
    fn test_frame_kind_values() {
        assert_eq!(FrameKind::SyncStep1 as u8, 1);
        assert_eq!(FrameKind::Update as u8, 3);
        assert_eq!(FrameKind::Pong as u8, 6);
    }
}
