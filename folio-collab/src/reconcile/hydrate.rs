//! One-shot startup reconciliation between the replica and the store.
//!
//! ```text
//! INIT ──► FETCHING ──┬─► FOUND          hydrate if the replica is empty
//!                     ├─► NOT_FOUND      create (signed in) or seed default
//!                     ├─► UNAUTHORIZED   seed default, read-only
//!                     ├─► FORBIDDEN      seed default, read-only
//!                     └─► NETWORK_ERROR  seed default
//!                               │
//!                               ▼
//!                           RESOLVED
//! ```
//!
//! Store content is only ever written into an empty replica: a peer may have
//! filled it over the relay while the fetch was in flight, and those edits win.
//! The store's rows are still returned so the reconciler can write back
//! whatever the replica holds that the store does not.
//!
//! In [`StoreMode::SingleFile`] the fetch reads the project's content column
//! instead of its file rows.

use std::collections::BTreeMap;

use folio_core::{
    default_document, DocumentModel, FileOp, FileTree, NodeId, NodeKind, Origin, DEFAULT_FILE_ID,
    DEFAULT_FILE_NAME,
};

use super::{ReconcileConfig, StoreMode};
use crate::store::{ProjectSnapshot, StorageClient, StorageError, StoredFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    Init,
    Fetching,
    Found,
    NotFound,
    Unauthorized,
    Forbidden,
    NetworkError,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationOutcome {
    /// The state reached after `Fetching`.
    pub state: HydrationState,
    /// The built-in default document was written into the replica.
    pub seeded_default: bool,
    /// Whether local changes should be written back to the store.
    pub writable: bool,
    /// File rows the store holds, by id; `None` when the store was not reached.
    pub remote_files: Option<BTreeMap<NodeId, StoredFile>>,
    /// Content column in single-file mode; empty when the store has none yet.
    pub remote_content: Option<String>,
}

impl HydrationOutcome {
    /// Whether the store already has a content column to PATCH.
    pub fn content_exists(&self) -> bool {
        self.remote_content.as_deref().is_some_and(|c| !c.is_empty())
    }
}

enum Fetched {
    Project(ProjectSnapshot),
    Content(String),
}

struct Machine {
    state: HydrationState,
    room: String,
}

impl Machine {
    fn to(&mut self, next: HydrationState) {
        log::debug!("Hydration {}: {:?} -> {:?}", self.room, self.state, next);
        self.state = next;
    }
}

/// Run hydration for `room` to completion. Never fails: every store error is
/// recovered by seeding the default document.
pub async fn hydrate(
    model: &DocumentModel,
    store: &dyn StorageClient,
    room: &str,
    config: &ReconcileConfig,
) -> HydrationOutcome {
    let mut machine = Machine {
        state: HydrationState::Init,
        room: room.to_string(),
    };
    machine.to(HydrationState::Fetching);

    let fetched = match config.mode {
        StoreMode::Files => store.fetch_project(room).await.map(Fetched::Project),
        StoreMode::SingleFile => store.fetch_content(room).await.map(Fetched::Content),
    };
    let reached = match &fetched {
        Ok(_) => HydrationState::Found,
        Err(StorageError::NotFound) => HydrationState::NotFound,
        Err(StorageError::Unauthorized) => HydrationState::Unauthorized,
        Err(StorageError::Forbidden) => HydrationState::Forbidden,
        Err(StorageError::NetworkFailure(_) | StorageError::ServerFailure(_)) => {
            HydrationState::NetworkError
        }
    };
    machine.to(reached);

    let mut outcome = HydrationOutcome {
        state: reached,
        seeded_default: false,
        writable: true,
        remote_files: None,
        remote_content: None,
    };

    match fetched {
        Ok(Fetched::Project(snapshot)) => {
            log::info!("Project {room} found with {} files", snapshot.files.len());
            outcome.remote_files = Some(hydrate_from(model, snapshot));
        }
        Ok(Fetched::Content(content)) => {
            log::info!("Project {room} found with {} bytes of content", content.len());
            hydrate_content(model, &content);
            outcome.remote_content = Some(content);
        }
        Err(StorageError::NotFound) => {
            if store.is_authenticated().await {
                log::info!("Project {room} not found, creating it");
                match store.create_project(room, &config.project_name).await {
                    Ok(snapshot) => {
                        outcome.remote_files = Some(hydrate_from(model, snapshot));
                        if config.mode == StoreMode::SingleFile {
                            // A new project's content column starts empty.
                            outcome.remote_content = Some(String::new());
                        }
                    }
                    Err(e) => {
                        log::warn!("Creating project {room} failed: {e}");
                        outcome.seeded_default = seed_default(model, config);
                    }
                }
            } else {
                log::info!("Project {room} not found and not signed in, using default content");
                outcome.seeded_default = seed_default(model, config);
                outcome.writable = false;
            }
        }
        Err(e @ (StorageError::Unauthorized | StorageError::Forbidden)) => {
            log::info!("Project {room} not accessible ({e}), using default content");
            outcome.seeded_default = seed_default(model, config);
            outcome.writable = false;
        }
        Err(e) => {
            log::error!("Loading project {room} failed: {e}");
            outcome.seeded_default = seed_default(model, config);
        }
    }

    ensure_active_file(model);
    machine.to(HydrationState::Resolved);
    outcome
}

/// Write the store's files into an empty replica. Returns the store's rows.
fn hydrate_from(model: &DocumentModel, snapshot: ProjectSnapshot) -> BTreeMap<NodeId, StoredFile> {
    let rows: BTreeMap<NodeId, StoredFile> = snapshot
        .files
        .into_iter()
        .map(|f| (f.id.clone(), f))
        .collect();
    let tree = FileTree::from_nodes(rows.values().cloned().map(StoredFile::into_node), None);

    // Parents before children, so every create finds its folder.
    let mut ops: Vec<FileOp> = tree
        .walk()
        .into_iter()
        .map(|node| match node.kind {
            NodeKind::File => FileOp::CreateFile {
                id: node.id.clone(),
                name: node.name.clone(),
                parent_id: node.parent_id.clone(),
                content: node.content.clone().unwrap_or_default(),
            },
            NodeKind::Folder => FileOp::CreateFolder {
                id: node.id.clone(),
                name: node.name.clone(),
                parent_id: node.parent_id.clone(),
            },
        })
        .collect();
    if let Some(first) = tree.first_file() {
        ops.push(FileOp::SetActive { id: first.id.clone() });
    }

    match model.apply_if_empty(&ops, Origin::Hydration) {
        Ok(Some(_)) => log::debug!("Hydrated {} nodes from the store", tree.len()),
        Ok(None) => log::debug!("Replica already populated, store content not applied"),
        Err(e) => log::error!("Store content could not be applied: {e}"),
    }
    rows
}

/// Write a single-file project's text into an empty replica as its main file.
fn hydrate_content(model: &DocumentModel, content: &str) {
    let ops = [
        FileOp::CreateFile {
            id: DEFAULT_FILE_ID.to_string(),
            name: DEFAULT_FILE_NAME.to_string(),
            parent_id: None,
            content: content.to_string(),
        },
        FileOp::SetActive {
            id: DEFAULT_FILE_ID.to_string(),
        },
    ];
    match model.apply_if_empty(&ops, Origin::Hydration) {
        Ok(Some(_)) => log::debug!("Hydrated {} bytes of content", content.len()),
        Ok(None) => log::debug!("Replica already populated, store content not applied"),
        Err(e) => log::error!("Store content could not be applied: {e}"),
    }
}

/// Seed the built-in document if the replica is empty.
fn seed_default(model: &DocumentModel, config: &ReconcileConfig) -> bool {
    let ops = [
        FileOp::CreateFile {
            id: DEFAULT_FILE_ID.to_string(),
            name: DEFAULT_FILE_NAME.to_string(),
            parent_id: None,
            content: default_document(&config.project_name, &config.default_author),
        },
        FileOp::SetActive {
            id: DEFAULT_FILE_ID.to_string(),
        },
    ];
    match model.apply_if_empty(&ops, Origin::Hydration) {
        Ok(seeded) => seeded.is_some(),
        Err(e) => {
            log::error!("Seeding default content failed: {e}");
            false
        }
    }
}

/// Point the active file at the first file if it is unset or gone.
fn ensure_active_file(model: &DocumentModel) {
    let tree = model.snapshot();
    if tree.active_file().is_some() {
        return;
    }
    if let Some(first) = tree.first_file() {
        let op = FileOp::SetActive { id: first.id.clone() };
        if let Err(e) = model.apply_batch(&[op], Origin::Hydration) {
            log::warn!("Selecting active file failed: {e}");
        }
    }
}
