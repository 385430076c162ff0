//! One client's view of one room: replica, relay connection, local cache and
//! reconciliation engine, owned together with an explicit open/close lifecycle.
//!
//! ```text
//! Session::open
//!   1. DocumentModel (fresh replica)
//!   2. LocalCache::load ──► apply (Origin::Cache)
//!   3. SyncClient::connect ──► handshake with peers (SyncStep1/SyncStep2)
//!   4. hydrate ──► HydrationOutcome
//!   5. reconcile::spawn
//!
//! local edit ──► DocumentModel ──on_update──► cache append
//!                                        └──► relay (Local / Hydration origin only)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use folio_core::{
    AwarenessMessage, Cursor, DocumentModel, FileOp, FileTree, ModelError, Origin, Subscription,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheError, LocalCache};
use crate::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use crate::protocol::{FrameKind, ProtocolError, SyncFrame};
use crate::reconcile::{self, FlushReport, HydrationOutcome, ReconcileConfig, ReconcileHandle};
use crate::store::StorageClient;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Relay base URL, e.g. `ws://localhost:4444`
    pub url: String,
    pub origin: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: String,
    /// Random when unset
    pub peer_id: Option<Uuid>,
    /// Work offline when unset
    pub relay: Option<RelaySettings>,
    /// No local cache when unset
    pub cache: Option<CacheConfig>,
    pub reconcile: ReconcileConfig,
    /// Display name and color shown to peers; generated when unset
    pub user_name: Option<String>,
    pub user_color: Option<String>,
    /// How long to wait for a peer's state before hydrating from the store
    /// (default: 500 ms). Hydrating an empty replica while a peer already
    /// holds the project would insert the same text twice.
    pub initial_sync_wait: Duration,
}

impl SessionConfig {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: String::new(),
            peer_id: None,
            relay: None,
            cache: None,
            reconcile: ReconcileConfig::default(),
            user_name: None,
            user_color: None,
            initial_sync_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("local cache: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An open room. Call [`close`](Self::close) to flush and disconnect.
pub struct Session {
    room: String,
    model: Arc<DocumentModel>,
    client: Option<Arc<SyncClient>>,
    cache: Option<Arc<LocalCache>>,
    reconciler: Option<ReconcileHandle>,
    hydration: HydrationOutcome,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub async fn open(
        config: SessionConfig,
        store: Arc<dyn StorageClient>,
    ) -> Result<Self, SessionError> {
        let peer_id = config.peer_id.unwrap_or_else(Uuid::new_v4);
        let room = config.room.clone();
        let model = Arc::new(DocumentModel::with_peer_id(peer_id));
        if let Some(name) = &config.user_name {
            let color = config
                .user_color
                .clone()
                .unwrap_or_else(|| model.awareness().local_state().color.clone());
            let _ = model.awareness().set_identity(name.clone(), color);
        }

        let mut subscriptions = Vec::new();
        let mut tasks = Vec::new();

        let cache = match &config.cache {
            Some(cache_config) => {
                let cache = Arc::new(LocalCache::open(cache_config.clone())?);
                restore_from_cache(&model, &cache, &room)?;
                compact_if_needed(&model, &cache, &room)?;
                let sink = cache.clone();
                let cache_room = room.clone();
                subscriptions.push(model.on_update(move |update, origin| {
                    if origin == Origin::Cache {
                        return;
                    }
                    if let Err(e) = sink.append_update(&cache_room, update) {
                        log::warn!("Caching update for {cache_room} failed: {e}");
                    }
                }));
                Some(cache)
            }
            None => None,
        };

        let client = match &config.relay {
            Some(relay) => {
                let mut client_config = ClientConfig::new(relay.url.clone(), room.clone());
                client_config.origin = relay.origin.clone();
                client_config.api_key = relay.api_key.clone();
                let client = Arc::new(SyncClient::new(peer_id, client_config));

                // Forward updates made on this replica; remote ones already reached the room.
                let (update_tx, update_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                subscriptions.push(model.on_update(move |update, origin| {
                    if matches!(origin, Origin::Local | Origin::Hydration) {
                        let _ = update_tx.send(update.to_vec());
                    }
                }));
                tasks.push(tokio::spawn(pump_updates(client.clone(), update_rx)));

                let synced = Arc::new(Notify::new());
                if let Some(events) = client.take_event_rx().await {
                    tasks.push(tokio::spawn(drive_events(
                        client.clone(),
                        model.clone(),
                        events,
                        synced.clone(),
                    )));
                }
                tasks.push(tokio::spawn(heartbeat(client.clone(), model.clone())));

                match client.connect().await {
                    Ok(()) => {
                        if timeout(config.initial_sync_wait, synced.notified()).await.is_err() {
                            log::debug!("No peer state for {room} yet, hydrating from the store");
                        }
                    }
                    Err(ProtocolError::Rejected(status)) => {
                        log::warn!("Relay rejected {room} (HTTP {status}), working offline");
                    }
                    Err(e) => {
                        log::warn!("Relay unreachable ({e}), retrying in the background");
                        tasks.push(tokio::spawn(reconnect(client.clone())));
                    }
                }
                Some(client)
            }
            None => None,
        };

        let hydration = reconcile::hydrate(&model, store.as_ref(), &room, &config.reconcile).await;
        log::info!(
            "Session {room} open: hydration {:?}, writable {}",
            hydration.state,
            hydration.writable
        );
        let reconciler =
            reconcile::spawn(model.clone(), store, room.clone(), &config.reconcile, &hydration);

        Ok(Self {
            room,
            model,
            client,
            cache,
            reconciler: Some(reconciler),
            hydration,
            subscriptions,
            tasks,
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn model(&self) -> &Arc<DocumentModel> {
        &self.model
    }

    pub fn snapshot(&self) -> Arc<FileTree> {
        self.model.snapshot()
    }

    pub fn hydration(&self) -> &HydrationOutcome {
        &self.hydration
    }

    /// Apply a local edit. The update reaches peers and the cache through the
    /// model's update subscriptions, and the store through the reconciler.
    pub fn apply(&self, op: FileOp) -> Result<Vec<u8>, SessionError> {
        Ok(self.model.apply_local(op)?)
    }

    pub async fn set_cursor(&self, cursor: Option<Cursor>) -> Result<(), SessionError> {
        let msg = self.model.awareness().set_cursor(cursor);
        self.send_awareness(&msg).await
    }

    pub async fn set_identity(&self, name: &str, color: &str) -> Result<(), SessionError> {
        let msg = self.model.awareness().set_identity(name, color);
        self.send_awareness(&msg).await
    }

    async fn send_awareness(&self, msg: &AwarenessMessage) -> Result<(), SessionError> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        if client.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let payload = msg.encode().map_err(ProtocolError::Serialization)?;
        client
            .send_frame(SyncFrame::awareness(client.peer_id(), 0, payload))
            .await?;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match &self.client {
            Some(client) => client.connection_state().await,
            None => ConnectionState::Disconnected,
        }
    }

    /// Flush pending store writes now.
    pub async fn flush(&self) -> FlushReport {
        match &self.reconciler {
            Some(reconciler) => reconciler.flush_now().await,
            None => FlushReport::default(),
        }
    }

    /// Final flush, cache compaction, leave the room and disconnect.
    pub async fn close(mut self) -> Result<FlushReport, SessionError> {
        let leave = self.model.awareness().leave_message();
        if let Err(e) = self.send_awareness(&leave).await {
            log::debug!("Sending leave for {} failed: {e}", self.room);
        }

        let report = match self.reconciler.take() {
            Some(reconciler) => reconciler.shutdown().await,
            None => FlushReport::default(),
        };

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.subscriptions.clear();

        if let Some(cache) = &self.cache {
            compact_if_needed(&self.model, cache, &self.room)?;
        }
        if let Some(client) = &self.client {
            client.disconnect().await;
        }
        log::info!("Session {} closed", self.room);
        Ok(report)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Fold the room's update log into one snapshot once it reaches the threshold.
fn compact_if_needed(
    model: &DocumentModel,
    cache: &LocalCache,
    room: &str,
) -> Result<(), SessionError> {
    if cache.needs_compaction(room)? {
        let dropped = cache.compact(room, &model.encode_state())?;
        log::debug!("Compacted cache for {room} ({dropped} updates)");
    }
    Ok(())
}

fn restore_from_cache(
    model: &DocumentModel,
    cache: &LocalCache,
    room: &str,
) -> Result<(), SessionError> {
    let entries = cache.load(room)?;
    let mut applied = 0;
    for update in &entries {
        match model.apply_remote(update, Origin::Cache) {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Skipping unreadable cache entry for {room}: {e}"),
        }
    }
    if applied > 0 {
        log::info!("Restored {room} from {applied} cache entries");
    }
    Ok(())
}

async fn pump_updates(client: Arc<SyncClient>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(update) = updates.recv().await {
        if let Err(e) = client.send_update(update).await {
            log::warn!("Update not sent: {e}");
        }
    }
}

async fn drive_events(
    client: Arc<SyncClient>,
    model: Arc<DocumentModel>,
    mut events: mpsc::Receiver<SyncEvent>,
    synced: Arc<Notify>,
) {
    let me = client.peer_id();
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Connected => {
                let hello = SyncFrame::sync_step1(me, None, model.state_vector());
                let join = model.awareness().join_message();
                send_all(&client, [Some(hello), awareness_frame(me, &join)]).await;
            }
            SyncEvent::Disconnected => {
                model.awareness().clear();
                // Inline, so closing the session (which aborts this task) stops it.
                reconnect(client.clone()).await;
            }
            SyncEvent::Frame(frame) => {
                let step2 = frame.kind == FrameKind::SyncStep2;
                handle_frame(&client, &model, frame).await;
                if step2 {
                    synced.notify_one();
                }
            }
        }
    }
}

async fn handle_frame(client: &SyncClient, model: &DocumentModel, frame: SyncFrame) {
    let me = client.peer_id();
    let from = frame.peer_id;
    match frame.kind {
        FrameKind::SyncStep1 => {
            let diff = match model.encode_diff(&frame.payload) {
                Ok(diff) => diff,
                Err(e) => {
                    log::warn!("Bad state vector from {from}: {e}");
                    return;
                }
            };
            let mut replies = vec![Some(SyncFrame::sync_step2(me, from, diff))];
            // A broadcast step 1 comes from a joiner: ask for its state too and
            // introduce ourselves.
            if frame.to.is_none() {
                replies.push(Some(SyncFrame::sync_step1(me, Some(from), model.state_vector())));
                let join = model.awareness().join_message();
                replies.push(awareness_frame(me, &join));
            }
            send_all(client, replies).await;
        }
        FrameKind::SyncStep2 | FrameKind::Update => {
            if let Err(e) = model.apply_remote(&frame.payload, Origin::Remote) {
                log::warn!("Dropping update from {from}: {e}");
            }
        }
        FrameKind::Awareness => match AwarenessMessage::decode(&frame.payload) {
            Ok(msg) => {
                model.awareness().apply(&msg, Instant::now());
            }
            Err(e) => log::debug!("Bad awareness message from {from}: {e}"),
        },
        FrameKind::Ping | FrameKind::Pong => model.awareness().touch(&from, Instant::now()),
    }
}

fn awareness_frame(me: Uuid, msg: &AwarenessMessage) -> Option<SyncFrame> {
    msg.encode()
        .map(|payload| SyncFrame::awareness(me, 0, payload))
        .ok()
}

async fn send_all(client: &SyncClient, frames: impl IntoIterator<Item = Option<SyncFrame>>) {
    for frame in frames.into_iter().flatten() {
        if let Err(e) = client.send_frame(frame).await {
            log::debug!("Frame not sent: {e}");
        }
    }
}

/// Ping the room and drop peers that went quiet.
async fn heartbeat(client: Arc<SyncClient>, model: Arc<DocumentModel>) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tick.tick().await;
        let gone = model.awareness().sweep_idle(Instant::now());
        if !gone.is_empty() {
            log::debug!("{} peers timed out", gone.len());
        }
        if client.connection_state().await == ConnectionState::Connected {
            let _ = client.send_frame(SyncFrame::ping(client.peer_id())).await;
        }
    }
}

/// Reconnect with exponential backoff. Gives up on an admission rejection.
async fn reconnect(client: Arc<SyncClient>) {
    let mut delay = RECONNECT_BASE_DELAY;
    loop {
        tokio::time::sleep(delay).await;
        if client.connection_state().await != ConnectionState::Disconnected {
            return;
        }
        match client.connect().await {
            Ok(()) => return,
            Err(ProtocolError::Rejected(status)) => {
                log::warn!("Relay rejected reconnect (HTTP {status}), staying offline");
                return;
            }
            Err(e) => {
                log::debug!("Reconnect failed: {e}, next attempt in {delay:?}");
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::HydrationState;
    use crate::store::MemoryStore;
    use folio_core::DEFAULT_FILE_ID;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_offline_session_seeds_and_flushes() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::open(SessionConfig::new("thesis"), store.clone()).await.unwrap();
        assert_eq!(session.hydration().state, HydrationState::NotFound);
        assert_eq!(session.connection_state().await, ConnectionState::Disconnected);

        let main = session.snapshot().first_file().unwrap().id.clone();
        session
            .apply(FileOp::SetContent {
                id: main.clone(),
                content: "edited".into(),
            })
            .unwrap();
        let report = session.close().await.unwrap();
        assert_eq!(report.upserted, vec![main.clone()]);
        assert_eq!(store.file("thesis", &main).unwrap().content.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn test_cache_restores_offline_edits() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_authenticated(false);
        let mut config = SessionConfig::new("notes");
        config.cache = Some(CacheConfig::new(dir.path()));

        let first = Session::open(config.clone(), store.clone()).await.unwrap();
        assert!(first.hydration().seeded_default);
        first
            .apply(FileOp::CreateFile {
                id: "extra".into(),
                name: "extra.tex".into(),
                parent_id: None,
                content: "kept".into(),
            })
            .unwrap();
        first.close().await.unwrap();

        let second = Session::open(config, store).await.unwrap();
        let tree = second.snapshot();
        assert!(tree.contains(DEFAULT_FILE_ID));
        assert_eq!(tree.get("extra").and_then(|n| n.content.as_deref()), Some("kept"));
        // Restored replica is not re-seeded.
        assert!(!second.hydration().seeded_default);
        second.close().await.unwrap();
    }
}
