//! Local durable mirror of room replicas for offline continuity.
//!
//! Column families:
//! - `snapshots` — full Yrs state per room (LZ4 compressed)
//! - `updates`   — incremental Yrs updates, keyed by `room \0 sequence` (LZ4 compressed)
//!
//! Restoring a room applies the snapshot and then every update in sequence
//! order. Compaction replaces the snapshot with the replica's full state and
//! drops the updates it covers.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

pub mod rocks;

pub use rocks::{CacheConfig, CacheError, LocalCache};
