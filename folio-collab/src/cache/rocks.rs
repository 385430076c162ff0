//! RocksDB-backed [`LocalCache`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use rocksdb::{
    BlockBasedOptions, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use thiserror::Error;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES];

/// Separates the room id from the sequence number in update keys.
const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Logged updates per room before a session folds them into the snapshot,
    /// checked on open and on close (default: 500)
    pub compact_threshold: usize,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            compact_threshold: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("room id must not contain NUL bytes: {0:?}")]
    InvalidRoom(String),
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

pub struct LocalCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
    /// Next update sequence, shared by all rooms.
    sequence: AtomicU64,
}

impl LocalCache {
    /// Open or create the cache at `config.path`.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(2);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect();
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        let sequence = Self::recover_sequence(&db)?;
        log::debug!("Opened local cache at {:?} (next sequence {sequence})", config.path);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        if name == CF_UPDATES {
            opts.set_max_write_buffer_number(4);
        }
        opts
    }

    /// Highest sequence found in any update key, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, CacheError> {
        let Some(cf) = db.cf_handle(CF_UPDATES) else {
            return Ok(0);
        };
        let mut next = 0;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = split_key(&key).map(|(_, seq)| seq) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("missing column family {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Append one incremental update for `room`. Returns its sequence number.
    pub fn append_update(&self, room: &str, update: &[u8]) -> Result<u64, CacheError> {
        let prefix = room_prefix(room)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut key = prefix;
        key.extend_from_slice(&seq.to_be_bytes());
        let compressed = lz4_flex::compress_prepend_size(update);
        self.db
            .put_cf_opt(self.cf(CF_UPDATES)?, key, compressed, &self.write_opts())?;
        log::trace!("Cached update {seq} for {room} ({} bytes)", update.len());
        Ok(seq)
    }

    /// Everything cached for `room`, snapshot first then updates in order.
    /// Empty when the room was never cached.
    pub fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut out = Vec::new();
        if let Some(snapshot) = self.load_snapshot(room)? {
            out.push(snapshot);
        }
        for (_, update) in self.updates(room)? {
            out.push(update);
        }
        Ok(out)
    }

    pub fn load_snapshot(&self, room: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = room_prefix(room)?;
        match self.db.get_cf(self.cf(CF_SNAPSHOTS)?, &key)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| CacheError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Cached updates for `room` with their sequence numbers.
    pub fn updates(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, CacheError> {
        let prefix = room_prefix(room)?;
        let cf = self.cf(CF_UPDATES)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some((_, seq)) = split_key(&key) else {
                continue;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| CacheError::Compression(e.to_string()))?;
            out.push((seq, update));
        }
        Ok(out)
    }

    pub fn update_count(&self, room: &str) -> Result<usize, CacheError> {
        Ok(self.updates(room)?.len())
    }

    /// Whether `room` has logged at least `compact_threshold` updates since
    /// its last compaction.
    pub fn needs_compaction(&self, room: &str) -> Result<bool, CacheError> {
        Ok(self.update_count(room)? >= self.config.compact_threshold)
    }

    /// Replace the snapshot with `full_state` and drop the room's updates, atomically.
    ///
    /// `full_state` must cover every cached update, e.g. the replica's
    /// `encode_state()` taken after the cache was restored into it.
    pub fn compact(&self, room: &str, full_state: &[u8]) -> Result<usize, CacheError> {
        let key = room_prefix(room)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_SNAPSHOTS)?,
            &key,
            lz4_flex::compress_prepend_size(full_state),
        );
        let mut dropped = 0;
        for item in self
            .db
            .iterator_cf(cf_updates, IteratorMode::From(&key, Direction::Forward))
        {
            let (update_key, _) = item?;
            if !update_key.starts_with(&key) {
                break;
            }
            batch.delete_cf(cf_updates, &update_key);
            dropped += 1;
        }
        self.db.write_opt(batch, &self.write_opts())?;
        log::debug!("Compacted {room}: {dropped} updates folded into snapshot");
        Ok(dropped)
    }

    /// Forget everything cached for `room`.
    pub fn remove(&self, room: &str) -> Result<(), CacheError> {
        let key = room_prefix(room)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, &key);
        for item in self
            .db
            .iterator_cf(cf_updates, IteratorMode::From(&key, Direction::Forward))
        {
            let (update_key, _) = item?;
            if !update_key.starts_with(&key) {
                break;
            }
            batch.delete_cf(cf_updates, &update_key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Rooms with a cached snapshot.
    pub fn rooms(&self) -> Result<Vec<String>, CacheError> {
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_SNAPSHOTS)?, IteratorMode::Start) {
            let (key, _) = item?;
            let room = key.strip_suffix(&[KEY_SEPARATOR]).unwrap_or(&key);
            rooms.push(String::from_utf8_lossy(room).into_owned());
        }
        Ok(rooms)
    }
}

/// `room \0`, the snapshot key and the prefix of the room's update keys.
fn room_prefix(room: &str) -> Result<Vec<u8>, CacheError> {
    if room.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(CacheError::InvalidRoom(room.to_string()));
    }
    let mut key = Vec::with_capacity(room.len() + 9);
    key.extend_from_slice(room.as_bytes());
    key.push(KEY_SEPARATOR);
    Ok(key)
}

fn split_key(key: &[u8]) -> Option<(&[u8], u64)> {
    if key.len() < 9 {
        return None;
    }
    let (head, seq) = key.split_at(key.len() - 8);
    let room = head.strip_suffix(&[KEY_SEPARATOR])?;
    let seq = u64::from_be_bytes(seq.try_into().ok()?);
    Some((room, seq))
}
