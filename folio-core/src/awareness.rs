//! Ephemeral per-peer presence: who is in the room and where their cursor is.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! Awareness::set_cursor()  ──►  AwarenessMessage::Update { clock, … }
//!                                      │  (SyncFrame::Awareness over the relay)
//!                                      ▼
//!                          remote Awareness::apply()
//! ```
//!
//! Presence never enters the CRDT document and is never written to the cache
//! or the store. A peer's entry disappears on `Leave`, when the relay client
//! reports the peer gone, or after the idle timeout.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peers silent for longer than this are dropped by [`Awareness::sweep_idle`].
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cursor colors, paired with a light variant for selection highlight.
const PALETTE: [(&str, &str); 8] = [
    ("#FF6B6B", "#FFE5E5"),
    ("#4ECDC4", "#E5F9F6"),
    ("#45B7D1", "#E5F3F7"),
    ("#96CEB4", "#F0F7ED"),
    ("#FFEAA7", "#FFF9E5"),
    ("#DDA0DD", "#F5E5F5"),
    ("#FA8072", "#FFE5E0"),
    ("#98D8C8", "#E8F5F2"),
];

/// Caret position within one file. Offsets are UTF-8 byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub file_id: String,
    pub anchor: u32,
    pub head: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    pub color: String,
    pub color_light: String,
    pub cursor: Option<Cursor>,
}

impl AwarenessState {
    /// Display name `User NN` and a palette color, both derived from `peer_id`.
    pub fn generated(peer_id: Uuid) -> Self {
        let bits = peer_id.as_u128();
        let (color, color_light) = PALETTE[(bits % PALETTE.len() as u128) as usize];
        Self {
            name: format!("User {}", (bits >> 8) % 100),
            color: color.to_string(),
            color_light: color_light.to_string(),
            cursor: None,
        }
    }
}

/// Presence messages, carried in `SyncFrame` awareness payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join {
        peer_id: Uuid,
        state: AwarenessState,
    },
    /// Full state replacement. Dropped unless `clock` is newer than the last seen.
    Update {
        peer_id: Uuid,
        clock: u64,
        state: AwarenessState,
    },
    Leave {
        peer_id: Uuid,
    },
}

impl AwarenessMessage {
    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { peer_id, .. }
            | AwarenessMessage::Update { peer_id, .. }
            | AwarenessMessage::Leave { peer_id } => *peer_id,
        }
    }

    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }
}

#[derive(Debug, Clone)]
struct RemotePeer {
    state: AwarenessState,
    clock: u64,
    last_seen: Instant,
}

/// Local presence plus the last known presence of every remote peer.
pub struct Awareness {
    local_id: Uuid,
    local: AwarenessState,
    clock: u64,
    peers: HashMap<Uuid, RemotePeer>,
    idle_timeout: Duration,
}

impl Awareness {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            local: AwarenessState::generated(local_id),
            clock: 0,
            peers: HashMap::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    /// Replace the local display name and color (e.g. from the user profile).
    pub fn set_identity(&mut self, name: impl Into<String>, color: impl Into<String>) -> AwarenessMessage {
        self.local.name = name.into();
        self.local.color = color.into();
        self.local.color_light = format!("{}33", self.local.color);
        self.update_message()
    }

    pub fn set_cursor(&mut self, cursor: Option<Cursor>) -> AwarenessMessage {
        self.local.cursor = cursor;
        self.update_message()
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            peer_id: self.local_id,
            state: self.local.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            peer_id: self.local_id,
        }
    }

    fn update_message(&mut self) -> AwarenessMessage {
        self.clock += 1;
        AwarenessMessage::Update {
            peer_id: self.local_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Apply a message from the network. Returns `true` if the peer set changed.
    pub fn apply(&mut self, msg: &AwarenessMessage, now: Instant) -> bool {
        if msg.peer_id() == self.local_id {
            return false;
        }
        match msg {
            AwarenessMessage::Join { peer_id, state } => {
                self.peers.insert(
                    *peer_id,
                    RemotePeer {
                        state: state.clone(),
                        clock: 0,
                        last_seen: now,
                    },
                );
                true
            }
            AwarenessMessage::Update {
                peer_id,
                clock,
                state,
            } => match self.peers.get_mut(peer_id) {
                Some(peer) if *clock <= peer.clock => false,
                Some(peer) => {
                    peer.state = state.clone();
                    peer.clock = *clock;
                    peer.last_seen = now;
                    true
                }
                // Joined before we connected.
                None => {
                    self.peers.insert(
                        *peer_id,
                        RemotePeer {
                            state: state.clone(),
                            clock: *clock,
                            last_seen: now,
                        },
                    );
                    true
                }
            },
            AwarenessMessage::Leave { peer_id } => self.remove_peer(peer_id),
        }
    }

    /// Mark a peer as still present without changing its state (e.g. on ping).
    pub fn touch(&mut self, peer_id: &Uuid, now: Instant) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = now;
        }
    }

    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Drop peers not heard from within the idle timeout; returns their ids.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(peer_id).map(|p| &p.state)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&Uuid, &AwarenessState)> {
        self.peers.iter().map(|(id, p)| (id, &p.state))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> AwarenessState {
        AwarenessState {
            name: name.into(),
            color: "#4ECDC4".into(),
            color_light: "#E5F9F6".into(),
            cursor: None,
        }
    }

    #[test]
    fn test_generated_identity_is_stable() {
        let id = Uuid::from_u128(0xABCD);
        let a = AwarenessState::generated(id);
        let b = AwarenessState::generated(id);
        assert_eq!(a, b);
        assert!(a.name.starts_with("User "));
        assert!(PALETTE.iter().any(|(c, _)| *c == a.color));
    }

    #[test]
    fn test_join_update_leave() {
        let now = Instant::now();
        let mut local = Awareness::new(Uuid::from_u128(1));
        let peer = Uuid::from_u128(2);

        assert!(local.apply(&AwarenessMessage::Join { peer_id: peer, state: state("Ada") }, now));
        assert_eq!(local.peer(&peer).map(|s| s.name.as_str()), Some("Ada"));

        let mut moved = state("Ada");
        moved.cursor = Some(Cursor { file_id: "main".into(), anchor: 3, head: 7 });
        assert!(local.apply(
            &AwarenessMessage::Update { peer_id: peer, clock: 1, state: moved.clone() },
            now
        ));
        assert_eq!(local.peer(&peer), Some(&moved));

        assert!(local.apply(&AwarenessMessage::Leave { peer_id: peer }, now));
        assert_eq!(local.peer_count(), 0);
    }

    #[test]
    fn test_stale_update_ignored() {
        let now = Instant::now();
        let mut local = Awareness::new(Uuid::from_u128(1));
        let peer = Uuid::from_u128(2);
        local.apply(&AwarenessMessage::Update { peer_id: peer, clock: 5, state: state("new") }, now);
        let changed =
            local.apply(&AwarenessMessage::Update { peer_id: peer, clock: 4, state: state("old") }, now);
        assert!(!changed);
        assert_eq!(local.peer(&peer).map(|s| s.name.as_str()), Some("new"));
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut local = Awareness::new(Uuid::from_u128(1));
        let msg = local.join_message();
        assert!(!local.apply(&msg, Instant::now()));
        assert_eq!(local.peer_count(), 0);
    }

    #[test]
    fn test_local_updates_bump_clock() {
        let mut local = Awareness::new(Uuid::from_u128(1));
        let first = local.set_cursor(Some(Cursor { file_id: "a".into(), anchor: 0, head: 0 }));
        let second = local.set_identity("Grace", "#ee6352");
        match (first, second) {
            (AwarenessMessage::Update { clock: c1, .. }, AwarenessMessage::Update { clock: c2, state, .. }) => {
                assert!(c2 > c1);
                assert_eq!(state.name, "Grace");
                assert_eq!(state.color_light, "#ee635233");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn test_sweep_idle() {
        let start = Instant::now();
        let mut local = Awareness::new(Uuid::from_u128(1)).with_idle_timeout(Duration::from_secs(10));
        let quiet = Uuid::from_u128(2);
        let chatty = Uuid::from_u128(3);
        local.apply(&AwarenessMessage::Join { peer_id: quiet, state: state("q") }, start);
        local.apply(&AwarenessMessage::Join { peer_id: chatty, state: state("c") }, start);
        local.touch(&chatty, start + Duration::from_secs(8));

        let dropped = local.sweep_idle(start + Duration::from_secs(15));
        assert_eq!(dropped, vec![quiet]);
        assert!(local.peer(&chatty).is_some());
    }

    #[test]
    fn test_message_wire_roundtrip() {
        let msg = AwarenessMessage::Update {
            peer_id: Uuid::from_u128(9),
            clock: 3,
            state: state("Ada"),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(AwarenessMessage::decode(&bytes).unwrap(), msg);
    }
}
