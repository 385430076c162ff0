//! Keeps the backing store eventually consistent with a replica.
//!
//! ```text
//! DocumentModel ──subscribe──► delta channel ──► PendingChangeSet
//!                                                     │ Debounce (quiet period)
//!                                                     ▼
//!                                flush: take set ─► deletes (children first, sequential)
//!                                                 └► upserts (by depth, concurrent per depth)
//!                                                     │
//!                                                     ▼
//!                                               StorageClient
//! ```
//!
//! One engine runs per session, as a single task, so a flush is never
//! re-entered: changes that arrive while a flush is in flight wait in the
//! channel and start a fresh pending set and a fresh quiet period.
//!
//! Upserts always read the node from the snapshot at flush time, so only the
//! latest state reaches the store.
//!
//! In [`StoreMode::SingleFile`] a flush writes the active file's text to the
//! project's content column instead: POST the first time, PATCH after.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use folio_core::{DocumentModel, FileNode, FileTree, ModelDelta, NodeId, Origin, Subscription};
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::store::{FileUpdate, StorageClient, StorageError, StoredFile};

pub mod debounce;
pub mod hydrate;
pub mod pending;

pub use debounce::Debounce;
pub use hydrate::{hydrate, HydrationOutcome, HydrationState};
pub use pending::{delete_order, Change, PendingChangeSet};

/// What to do with a store write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and forget; the node is written again only when it next changes.
    Drop,
    /// Put the change back and flush again after an exponential backoff.
    Retry {
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl FailurePolicy {
    /// Backoff before attempt `attempt + 1`, or `None` when attempts are exhausted.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        match *self {
            FailurePolicy::Drop => None,
            FailurePolicy::Retry {
                max_attempts,
                base_delay,
                max_delay,
            } => {
                if attempt >= max_attempts {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Some(base_delay.saturating_mul(factor).min(max_delay))
            }
        }
    }
}

/// How a project is laid out in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreMode {
    /// One row per file or folder.
    #[default]
    Files,
    /// One text column per project, holding the active file.
    SingleFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Quiet period before a flush (default: 1000 ms)
    pub debounce: Duration,
    pub mode: StoreMode,
    pub failure_policy: FailurePolicy,
    /// Name for projects created on first open
    pub project_name: String,
    /// Author line of the built-in default document
    pub default_author: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            mode: StoreMode::Files,
            failure_policy: FailurePolicy::Drop,
            project_name: "Untitled Project".to_string(),
            default_author: "Anonymous".to_string(),
        }
    }
}

/// What one flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub upserted: Vec<NodeId>,
    pub deleted: Vec<NodeId>,
    pub failed: Vec<(NodeId, StorageError)>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty() && self.failed.is_empty()
    }
}

enum Command {
    Flush(oneshot::Sender<FlushReport>),
    Shutdown(oneshot::Sender<FlushReport>),
}

/// Flush engine state, owned by the engine task.
struct Engine {
    model: Arc<DocumentModel>,
    store: Arc<dyn StorageClient>,
    room: String,
    writable: bool,
    mode: StoreMode,
    policy: FailurePolicy,
    pending: PendingChangeSet,
    debounce: Debounce,
    /// Ids the store is known to hold; decides create vs update.
    known: BTreeSet<NodeId>,
    /// Single-file mode: the content column has been written, so saves PATCH.
    content_exists: bool,
    attempts: HashMap<NodeId, u32>,
    flushes: Arc<AtomicU64>,
    last_report: Arc<Mutex<Option<FlushReport>>>,
}

/// Running engine. Dropping the handle stops the engine without a final flush.
pub struct ReconcileHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    subscription: Option<Subscription>,
    flushes: Arc<AtomicU64>,
    last_report: Arc<Mutex<Option<FlushReport>>>,
    writable: bool,
}

/// Start the engine for a hydrated replica.
pub fn spawn(
    model: Arc<DocumentModel>,
    store: Arc<dyn StorageClient>,
    room: impl Into<String>,
    config: &ReconcileConfig,
    outcome: &HydrationOutcome,
) -> ReconcileHandle {
    let (delta_tx, delta_rx) = mpsc::unbounded_channel::<ModelDelta>();
    let subscription = model.subscribe(move |delta| {
        // Store content coming back in would only be echoed.
        if delta.origin != Origin::Hydration {
            let _ = delta_tx.send(delta.clone());
        }
    });

    let mut engine = Engine {
        model,
        store,
        room: room.into(),
        writable: outcome.writable,
        mode: config.mode,
        policy: config.failure_policy,
        pending: PendingChangeSet::new(),
        debounce: Debounce::new(config.debounce),
        known: outcome
            .remote_files
            .as_ref()
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default(),
        content_exists: outcome.content_exists(),
        attempts: HashMap::new(),
        flushes: Arc::new(AtomicU64::new(0)),
        last_report: Arc::new(Mutex::new(None)),
    };

    // Nodes that reached the replica before the engine existed (peers, cache)
    // and that the store does not hold as they are now.
    if engine.writable {
        let tree = engine.model.snapshot();
        for id in stale_nodes(&tree, outcome, config.mode) {
            engine.pending.upsert(id);
        }
        if !engine.pending.is_empty() {
            log::debug!("{} nodes differ from the store", engine.pending.len());
            engine.debounce.reset();
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let flushes = engine.flushes.clone();
    let last_report = engine.last_report.clone();
    let task = tokio::spawn(engine.run(delta_rx, cmd_rx));

    ReconcileHandle {
        commands: cmd_tx,
        task,
        subscription: Some(subscription),
        flushes,
        last_report,
        writable: outcome.writable,
    }
}

/// Replica nodes the store is missing or holds an older version of.
/// Store rows absent from the replica are left alone.
fn stale_nodes(tree: &FileTree, outcome: &HydrationOutcome, mode: StoreMode) -> Vec<NodeId> {
    match mode {
        StoreMode::Files => {
            let Some(rows) = &outcome.remote_files else {
                return Vec::new();
            };
            tree.iter()
                .filter(|node| !rows.get(&node.id).is_some_and(|row| row.matches(node)))
                .map(|node| node.id.clone())
                .collect()
        }
        StoreMode::SingleFile => {
            let (Some(stored), Some(file)) = (&outcome.remote_content, content_file(tree)) else {
                return Vec::new();
            };
            if file.content.as_deref().unwrap_or_default() == stored.as_str() {
                Vec::new()
            } else {
                vec![file.id.clone()]
            }
        }
    }
}

/// The file whose text a single-file project stores.
fn content_file(tree: &FileTree) -> Option<&FileNode> {
    tree.active_file().or_else(|| tree.first_file())
}

impl ReconcileHandle {
    /// Flush whatever is pending now, without waiting for the quiet period.
    pub async fn flush_now(&self) -> FlushReport {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).await.is_err() {
            return FlushReport::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Detach from the model, run a final flush and stop the engine.
    pub async fn shutdown(mut self) -> FlushReport {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_err() {
            return FlushReport::default();
        }
        let report = rx.await.unwrap_or_default();
        let _ = (&mut self.task).await;
        report
    }

    /// Flushes that issued at least one store call.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<FlushReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for ReconcileHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Engine {
    async fn run(
        mut self,
        mut deltas: mpsc::UnboundedReceiver<ModelDelta>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut attached = true;
        loop {
            let expired = self.debounce.expired();
            tokio::select! {
                delta = deltas.recv(), if attached => match delta {
                    Some(delta) => self.record(&delta),
                    None => attached = false,
                },
                _ = expired => {
                    self.debounce.cancel();
                    self.flush().await;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.command(cmd, &mut deltas).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        log::debug!("Reconciler for {} stopped", self.room);
    }

    /// Returns `true` when the engine should stop.
    async fn command(
        &mut self,
        cmd: Command,
        deltas: &mut mpsc::UnboundedReceiver<ModelDelta>,
    ) -> bool {
        // Changes already committed belong in this flush.
        while let Ok(delta) = deltas.try_recv() {
            self.record(&delta);
        }
        self.debounce.cancel();
        match cmd {
            Command::Flush(reply) => {
                let report = self.flush().await;
                let _ = reply.send(report);
                false
            }
            Command::Shutdown(reply) => {
                let report = self.flush().await;
                let _ = reply.send(report);
                true
            }
        }
    }

    fn record(&mut self, delta: &ModelDelta) {
        if !self.writable {
            log::debug!(
                "Read-only session, discarding {} changes",
                delta.upserted.len() + delta.removed.len()
            );
            return;
        }
        self.pending.record(delta);
        for id in delta.upserted.iter().chain(delta.removed.keys()) {
            self.attempts.remove(id);
        }
        self.debounce.reset();
    }

    async fn flush(&mut self) -> FlushReport {
        let batch = self.pending.take();
        if batch.is_empty() || !self.writable {
            return FlushReport::default();
        }
        let (report, failed) = match self.mode {
            StoreMode::Files => self.flush_files(batch).await,
            StoreMode::SingleFile => self.flush_content().await,
        };

        for id in report.upserted.iter().chain(&report.deleted) {
            self.attempts.remove(id);
        }
        self.handle_failures(failed);

        if !report.is_empty() {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        report
    }

    async fn flush_files(
        &mut self,
        batch: PendingChangeSet,
    ) -> (FlushReport, Vec<(NodeId, Change)>) {
        let (upserts, deletes) = batch.into_parts();
        log::debug!(
            "Flushing {}: {} upserts, {} deletes",
            self.room,
            upserts.len(),
            deletes.len()
        );

        let mut report = FlushReport::default();
        let mut failed: Vec<(NodeId, Change)> = Vec::new();

        // Deletes first, children before parents, one at a time.
        let removed: BTreeMap<NodeId, FileNode> =
            deletes.iter().map(|n| (n.id.clone(), n.clone())).collect();
        for id in delete_order(&deletes) {
            match self.store.delete_file(&self.room, &id).await {
                Ok(()) => {
                    self.known.remove(&id);
                    report.deleted.push(id);
                }
                Err(e) => {
                    log::warn!("Deleting {id} from {} failed: {e}", self.room);
                    if let Some(node) = removed.get(&id) {
                        failed.push((id.clone(), Change::Delete(node.clone())));
                    }
                    report.failed.push((id, e));
                }
            }
        }

        // Upserts by depth so a folder exists before its children.
        let tree = self.model.snapshot();
        let mut by_depth: BTreeMap<usize, Vec<&FileNode>> = BTreeMap::new();
        for id in &upserts {
            match (tree.get(id), tree.depth(id)) {
                (Some(node), Some(depth)) => by_depth.entry(depth).or_default().push(node),
                _ => log::debug!("Skipping {id}: no longer in the replica"),
            }
        }
        for nodes in by_depth.values() {
            let results = join_all(nodes.iter().map(|node| self.upsert(node))).await;
            for (node, result) in nodes.iter().zip(results) {
                match result {
                    Ok(()) => {
                        self.known.insert(node.id.clone());
                        report.upserted.push(node.id.clone());
                    }
                    Err(e) => {
                        log::warn!("Writing {} to {} failed: {e}", node.id, self.room);
                        failed.push((node.id.clone(), Change::Upsert));
                        report.failed.push((node.id.clone(), e));
                    }
                }
            }
        }

        (report, failed)
    }

    /// Save the active file's text; deletes and other files have nothing to write.
    async fn flush_content(&mut self) -> (FlushReport, Vec<(NodeId, Change)>) {
        let mut report = FlushReport::default();
        let mut failed = Vec::new();
        let tree = self.model.snapshot();
        let Some(file) = content_file(&tree) else {
            log::debug!("No file to save for {}", self.room);
            return (report, failed);
        };
        let content = file.content.as_deref().unwrap_or_default();
        log::debug!("Saving {} bytes of content for {}", content.len(), self.room);
        match self
            .store
            .save_content(&self.room, content, !self.content_exists)
            .await
        {
            Ok(()) => {
                self.content_exists = true;
                report.upserted.push(file.id.clone());
            }
            Err(e) => {
                log::warn!("Saving content of {} failed: {e}", self.room);
                failed.push((file.id.clone(), Change::Upsert));
                report.failed.push((file.id.clone(), e));
            }
        }
        (report, failed)
    }

    async fn upsert(&self, node: &FileNode) -> Result<(), StorageError> {
        if self.known.contains(&node.id) {
            self.store
                .update_file(&self.room, &node.id, &FileUpdate::from_node(node))
                .await
        } else {
            self.store.create_file(&self.room, &StoredFile::from(node)).await
        }
    }

    fn handle_failures(&mut self, failed: Vec<(NodeId, Change)>) {
        let mut retry_in: Option<Duration> = None;
        for (id, change) in failed {
            let attempt = {
                let count = self.attempts.entry(id.clone()).or_insert(0);
                *count += 1;
                *count
            };
            match self.policy.backoff(attempt) {
                Some(wait) => {
                    log::debug!("Retrying {id} in {wait:?} (attempt {attempt})");
                    self.pending.requeue(id, change);
                    retry_in = Some(retry_in.map_or(wait, |w| w.max(wait)));
                }
                None => {
                    log::warn!("Giving up on {id} after {attempt} attempts");
                    self.attempts.remove(&id);
                }
            }
        }
        if let Some(wait) = retry_in {
            // A newer change may already have armed a sooner deadline.
            let sooner = self
                .debounce
                .deadline()
                .is_some_and(|at| at <= tokio::time::Instant::now() + wait);
            if !sooner {
                self.debounce.reset_after(wait);
            }
        }
    }
}
