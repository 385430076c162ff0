//! # folio-collab — networking, persistence and reconciliation for Folio
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   opaque frames   ┌──────────────┐   opaque frames   ┌─────────────┐
//! │ SyncClient  │ ◄───────────────► │ RelayServer  │ ◄───────────────► │ SyncClient  │
//! │ (peer A)    │                   │ admission +  │                   │ (peer B)    │
//! └──────┬──────┘                   │ room fan-out │                   └─────────────┘
//!        │                          └──────────────┘
//!        ▼
//! ┌─────────────┐  deltas  ┌────────────┐  REST   ┌───────────────┐
//! │DocumentModel│ ───────► │ Reconciler │ ──────► │ StorageClient │
//! └──────┬──────┘          └────────────┘         └───────────────┘
//!        │ updates
//!        ▼
//! ┌─────────────┐
//! │ LocalCache  │
//! └─────────────┘
//! ```
//!
//! The relay never holds document state; every peer keeps a full replica and
//! mirrors it to the store through its own reconciler.
//!
//! ## Modules
//!
//! - [`protocol`] — peer frames (bincode) and protocol errors
//! - [`admission`] — rate limiting, origin and credential checks
//! - [`broadcast`] — room fan-out with backpressure
//! - [`server`] — admission relay
//! - [`config`] — relay configuration from the environment
//! - [`client`] — relay client with offline queue
//! - [`store`] — storage API client (HTTP and in-memory)
//! - [`reconcile`] — hydration and debounced flushing to the store
//! - [`cache`] — RocksDB local cache
//! - [`session`] — one room, opened and closed explicitly

pub mod admission;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod store;

pub use admission::{AdmissionError, AdmissionRequest, Gatekeeper, RateLimiter};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerConnection, RoomManager};
pub use cache::{CacheConfig, CacheError, LocalCache};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, RelayConfig};
pub use protocol::{FrameKind, LamportClock, ProtocolError, SyncFrame};
pub use reconcile::{
    FailurePolicy, FlushReport, HydrationOutcome, HydrationState, PendingChangeSet,
    ReconcileConfig, ReconcileHandle, StoreMode,
};
pub use server::{RelayServer, RelayStats};
pub use session::{RelaySettings, Session, SessionConfig, SessionError};
pub use store::{HttpStore, MemoryStore, StorageClient, StorageError};
