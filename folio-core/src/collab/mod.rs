//! CRDT-backed replicated file tree.
//!
//! ```text
//!  FileOp ──► plan (validate on shadow tree) ──► Mutation list
//!                                                   │
//!                                                   ▼
//!                                   yrs TransactionMut (one per batch)
//!                                                   │ encode_update_v1
//!                    remote update ─────────────────┤
//!                                                   ▼
//!                                 materialize FileTree ──► diff ──► ModelDelta
//!                                                   │                   │
//!                                            update subscribers   delta subscribers
//! ```
//!
//! Yrs document schema (one document per room):
//!
//! | Root           | Type | Content                          |
//! |----------------|------|----------------------------------|
//! | `kind`         | Map  | node id → `"file"` / `"folder"`  |
//! | `name`         | Map  | node id → display name           |
//! | `parent`       | Map  | node id → parent id or null      |
//! | `meta`         | Map  | `activeFileId` → node id         |
//! | `file:{id}`    | Text | body of file `id`                |
//!
//! A node exists iff its id is a key of `kind`. Map keys resolve concurrent
//! writes through Yrs' causal ordering with client-id tie-break; concurrent
//! inserts at one text position are ordered by client id. Text offsets are
//! UTF-8 byte offsets.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (Automatic Conflict Resolution)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, MapRef, OffsetKind, Options, Out, ReadTxn, StateVector, Text,
    Transact, TransactionMut, Update, WriteTxn,
};

use crate::awareness::Awareness;
use crate::error::ModelError;
use crate::tree::FileTree;
use crate::{FileNode, NodeId, NodeKind};

mod subscription;

use subscription::Registry;
pub use subscription::Subscription;

const KIND_MAP: &str = "kind";
const NAME_MAP: &str = "name";
const PARENT_MAP: &str = "parent";
const META_MAP: &str = "meta";
const ACTIVE_KEY: &str = "activeFileId";

/// Largest client id Yrs encodes losslessly (53 bits).
const MAX_CLIENT_ID: u64 = (1 << 53) - 1;

/// Yrs client id for a peer: all 128 bits of the UUID folded and mixed
/// (splitmix64 finalizer), then cut to 53 bits. Two peers collide only with
/// probability about n²/2⁵⁴ for n peers in one room.
fn client_id(peer_id: Uuid) -> u64 {
    let bits = peer_id.as_u128();
    let mut x = ((bits >> 64) as u64) ^ (bits as u64).rotate_left(32);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x & MAX_CLIENT_ID
}

fn text_name(id: &str) -> String {
    format!("file:{id}")
}

/// Where a change came from. Carried on every [`ModelDelta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Edit made on this replica.
    Local,
    /// Update received from a peer.
    Remote,
    /// Content written while reconciling with the backing store at startup.
    Hydration,
    /// State restored from the local cache.
    Cache,
}

/// Replicated operations on the file tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FileOp {
    CreateFile {
        id: NodeId,
        name: String,
        parent_id: Option<NodeId>,
        content: String,
    },
    CreateFolder {
        id: NodeId,
        name: String,
        parent_id: Option<NodeId>,
    },
    Rename {
        id: NodeId,
        name: String,
    },
    Move {
        id: NodeId,
        parent_id: Option<NodeId>,
    },
    InsertText {
        id: NodeId,
        index: u32,
        text: String,
    },
    DeleteText {
        id: NodeId,
        index: u32,
        len: u32,
    },
    /// Replace the whole body (delete all, insert new).
    SetContent {
        id: NodeId,
        content: String,
    },
    /// Delete a node; folders take all descendants with them.
    Delete {
        id: NodeId,
    },
    SetActive {
        id: NodeId,
    },
}

/// Net change produced by one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDelta {
    pub origin: Origin,
    /// Nodes that were added or whose name, parent or content changed.
    pub upserted: BTreeSet<NodeId>,
    /// Nodes that disappeared, with their last materialized state.
    pub removed: BTreeMap<NodeId, FileNode>,
}

impl ModelDelta {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    fn between(before: &FileTree, after: &FileTree, origin: Origin) -> Self {
        let upserted = after
            .iter()
            .filter(|node| before.get(&node.id) != Some(*node))
            .map(|node| node.id.clone())
            .collect();
        let removed = before
            .iter()
            .filter(|node| !after.contains(&node.id))
            .map(|node| (node.id.clone(), node.clone()))
            .collect();
        Self {
            origin,
            upserted,
            removed,
        }
    }
}

type DeltaCallback = dyn Fn(&ModelDelta) + Send + Sync;
type UpdateCallback = dyn Fn(&[u8], Origin) + Send + Sync;

struct Roots {
    kinds: MapRef,
    names: MapRef,
    parents: MapRef,
    meta: MapRef,
}

struct State {
    doc: Doc,
    roots: Roots,
    tree: Arc<FileTree>,
}

/// One replica of a room's project.
///
/// All mutation goes through [`apply_local`](Self::apply_local),
/// [`apply_batch`](Self::apply_batch) or [`apply_remote`](Self::apply_remote);
/// each call is one Yrs transaction followed by one notification round.
/// Subscribers run on the calling thread after the model lock is released and
/// must not mutate the model from inside the callback.
pub struct DocumentModel {
    peer_id: Uuid,
    state: Mutex<State>,
    /// Taken before `state`; serializes commit + notification rounds.
    notify: Mutex<()>,
    deltas: Registry<DeltaCallback>,
    updates: Registry<UpdateCallback>,
    awareness: Mutex<Awareness>,
}

impl DocumentModel {
    /// Create an empty replica with a random peer identity.
    pub fn new() -> Self {
        Self::with_peer_id(Uuid::new_v4())
    }

    /// Create an empty replica for a known peer identity.
    ///
    /// The Yrs client id is derived from `peer_id` (see [`client_id`]); it is
    /// the tie-break for concurrent inserts at the same position.
    pub fn with_peer_id(peer_id: Uuid) -> Self {
        let options = Options {
            client_id: client_id(peer_id),
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        };
        let doc = Doc::with_options(options);
        let roots = Roots {
            kinds: doc.get_or_insert_map(KIND_MAP),
            names: doc.get_or_insert_map(NAME_MAP),
            parents: doc.get_or_insert_map(PARENT_MAP),
            meta: doc.get_or_insert_map(META_MAP),
        };
        Self {
            peer_id,
            state: Mutex::new(State {
                doc,
                roots,
                tree: Arc::new(FileTree::empty()),
            }),
            notify: Mutex::new(()),
            deltas: Registry::new(),
            updates: Registry::new(),
            awareness: Mutex::new(Awareness::new(peer_id)),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Apply one local operation and return the update to broadcast.
    pub fn apply_local(&self, op: FileOp) -> Result<Vec<u8>, ModelError> {
        self.apply_batch(std::slice::from_ref(&op), Origin::Local)
    }

    /// Apply several operations in one transaction.
    ///
    /// Every operation is validated before anything is written, so a failing
    /// batch leaves the replica untouched.
    pub fn apply_batch(&self, ops: &[FileOp], origin: Origin) -> Result<Vec<u8>, ModelError> {
        self.transact(ops, origin, false)
            .map(|update| update.unwrap_or_default())
    }

    /// Apply `ops` only if the replica holds no nodes, atomically with the check.
    ///
    /// Returns `None` (and writes nothing) when the replica is already populated.
    pub fn apply_if_empty(
        &self,
        ops: &[FileOp],
        origin: Origin,
    ) -> Result<Option<Vec<u8>>, ModelError> {
        self.transact(ops, origin, true)
    }

    /// Merge an update produced by another replica (or read from the cache).
    pub fn apply_remote(&self, update: &[u8], origin: Origin) -> Result<(), ModelError> {
        let decoded = Update::decode_v1(update)?;
        let order = self.lock_order();
        let state = self.lock_state();
        {
            let mut txn = state.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ModelError::Decode(e.to_string()))?;
        }
        self.commit(state, order, update.to_vec(), origin);
        Ok(())
    }

    /// Current materialized view.
    pub fn snapshot(&self) -> Arc<FileTree> {
        self.lock_state().tree.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().tree.is_empty()
    }

    /// Encoded state vector, sent as the first step of the peer handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let state = self.lock_state();
        let txn = state.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ModelError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let state = self.lock_state();
        let txn = state.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let state = self.lock_state();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Register a callback for net file-tree changes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModelDelta) + Send + Sync + 'static,
    {
        self.deltas.add(Arc::new(callback))
    }

    /// Register a callback for the raw update of every committed transaction,
    /// tagged with where it came from.
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8], Origin) + Send + Sync + 'static,
    {
        self.updates.add(Arc::new(callback))
    }

    /// Presence registry for this replica. Never part of the CRDT state.
    pub fn awareness(&self) -> MutexGuard<'_, Awareness> {
        self.awareness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_order(&self) -> MutexGuard<'_, ()> {
        self.notify
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transact(
        &self,
        ops: &[FileOp],
        origin: Origin,
        only_if_empty: bool,
    ) -> Result<Option<Vec<u8>>, ModelError> {
        let order = self.lock_order();
        let state = self.lock_state();
        if only_if_empty && !state.tree.is_empty() {
            return Ok(None);
        }
        if ops.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let mutations = plan(&state.tree, ops)?;
        let update = {
            let State { doc, roots, .. } = &*state;
            let mut txn = doc.transact_mut();
            for mutation in &mutations {
                execute(roots, &mut txn, mutation);
            }
            txn.encode_update_v1()
        };
        self.commit(state, order, update.clone(), origin);
        Ok(Some(update))
    }

    /// Re-materialize, swap the cached tree and notify subscribers.
    ///
    /// `order` is held across the callbacks so rounds never interleave; the
    /// state lock is released first so callbacks may read snapshots.
    fn commit(
        &self,
        mut state: MutexGuard<'_, State>,
        order: MutexGuard<'_, ()>,
        update: Vec<u8>,
        origin: Origin,
    ) {
        let after = Arc::new(materialize(&state.doc, &state.roots));
        let delta = ModelDelta::between(&state.tree, &after, origin);
        state.tree = after;
        drop(state);

        if !update.is_empty() {
            for callback in self.updates.snapshot() {
                callback(&update, origin);
            }
        }
        if !delta.is_empty() {
            log::trace!(
                "Model delta ({:?}): {} upserted, {} removed",
                delta.origin,
                delta.upserted.len(),
                delta.removed.len()
            );
            for callback in self.deltas.snapshot() {
                callback(&delta);
            }
        }
        drop(order);
    }
}

impl Default for DocumentModel {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Plan / execute ─────────────────────────────────────────────────

/// Primitive writes against the Yrs roots. Produced only by [`plan`], so they
/// never fail when executed.
#[derive(Debug, Clone, PartialEq)]
enum Mutation {
    PutNode {
        id: NodeId,
        kind: NodeKind,
        name: String,
        parent_id: Option<NodeId>,
        content: String,
    },
    SetName {
        id: NodeId,
        name: String,
    },
    SetParent {
        id: NodeId,
        parent_id: Option<NodeId>,
    },
    Insert {
        id: NodeId,
        index: u32,
        text: String,
    },
    Remove {
        id: NodeId,
        index: u32,
        len: u32,
    },
    DropNode {
        id: NodeId,
        kind: NodeKind,
    },
    SetActive(NodeId),
    ClearActive,
}

fn plan(tree: &FileTree, ops: &[FileOp]) -> Result<Vec<Mutation>, ModelError> {
    let mut shadow: BTreeMap<NodeId, FileNode> =
        tree.iter().map(|n| (n.id.clone(), n.clone())).collect();
    let mut active = tree.active_id().map(str::to_string);
    let mut out = Vec::new();

    for op in ops {
        match op {
            FileOp::CreateFile {
                id,
                name,
                parent_id,
                content,
            } => {
                if shadow.contains_key(id) {
                    return Err(ModelError::DuplicateNode(id.clone()));
                }
                check_parent(&shadow, parent_id.as_deref())?;
                shadow.insert(
                    id.clone(),
                    FileNode::file(id.clone(), name.clone(), parent_id.clone(), content.clone()),
                );
                out.push(Mutation::PutNode {
                    id: id.clone(),
                    kind: NodeKind::File,
                    name: name.clone(),
                    parent_id: parent_id.clone(),
                    content: content.clone(),
                });
            }
            FileOp::CreateFolder {
                id,
                name,
                parent_id,
            } => {
                if shadow.contains_key(id) {
                    return Err(ModelError::DuplicateNode(id.clone()));
                }
                check_parent(&shadow, parent_id.as_deref())?;
                shadow.insert(
                    id.clone(),
                    FileNode::folder(id.clone(), name.clone(), parent_id.clone()),
                );
                out.push(Mutation::PutNode {
                    id: id.clone(),
                    kind: NodeKind::Folder,
                    name: name.clone(),
                    parent_id: parent_id.clone(),
                    content: String::new(),
                });
            }
            FileOp::Rename { id, name } => {
                let node = shadow
                    .get_mut(id)
                    .ok_or_else(|| ModelError::UnknownNode(id.clone()))?;
                node.name = name.clone();
                out.push(Mutation::SetName {
                    id: id.clone(),
                    name: name.clone(),
                });
            }
            FileOp::Move { id, parent_id } => {
                if !shadow.contains_key(id) {
                    return Err(ModelError::UnknownNode(id.clone()));
                }
                check_parent(&shadow, parent_id.as_deref())?;
                if let Some(parent) = parent_id {
                    let mut cursor = Some(parent.as_str());
                    while let Some(ancestor) = cursor {
                        if ancestor == id {
                            return Err(ModelError::WouldCycle {
                                id: id.clone(),
                                parent: parent.clone(),
                            });
                        }
                        cursor = shadow.get(ancestor).and_then(|n| n.parent_id.as_deref());
                    }
                }
                if let Some(node) = shadow.get_mut(id) {
                    node.parent_id = parent_id.clone();
                }
                out.push(Mutation::SetParent {
                    id: id.clone(),
                    parent_id: parent_id.clone(),
                });
            }
            FileOp::InsertText { id, index, text } => {
                let body = file_body(&mut shadow, id)?;
                check_range(id, body, *index, 0)?;
                body.insert_str(*index as usize, text);
                if !text.is_empty() {
                    out.push(Mutation::Insert {
                        id: id.clone(),
                        index: *index,
                        text: text.clone(),
                    });
                }
            }
            FileOp::DeleteText { id, index, len } => {
                let body = file_body(&mut shadow, id)?;
                check_range(id, body, *index, *len)?;
                let start = *index as usize;
                body.replace_range(start..start + *len as usize, "");
                if *len > 0 {
                    out.push(Mutation::Remove {
                        id: id.clone(),
                        index: *index,
                        len: *len,
                    });
                }
            }
            FileOp::SetContent { id, content } => {
                let body = file_body(&mut shadow, id)?;
                let old_len = body.len() as u32;
                *body = content.clone();
                if old_len > 0 {
                    out.push(Mutation::Remove {
                        id: id.clone(),
                        index: 0,
                        len: old_len,
                    });
                }
                if !content.is_empty() {
                    out.push(Mutation::Insert {
                        id: id.clone(),
                        index: 0,
                        text: content.clone(),
                    });
                }
            }
            FileOp::Delete { id } => {
                if !shadow.contains_key(id) {
                    return Err(ModelError::UnknownNode(id.clone()));
                }
                for doomed in subtree(&shadow, id) {
                    if let Some(node) = shadow.remove(&doomed) {
                        if active.as_deref() == Some(doomed.as_str()) {
                            active = None;
                            out.push(Mutation::ClearActive);
                        }
                        out.push(Mutation::DropNode {
                            id: doomed,
                            kind: node.kind,
                        });
                    }
                }
            }
            FileOp::SetActive { id } => {
                let node = shadow
                    .get(id)
                    .ok_or_else(|| ModelError::UnknownNode(id.clone()))?;
                if !node.is_file() {
                    return Err(ModelError::NotAFile(id.clone()));
                }
                active = Some(id.clone());
                out.push(Mutation::SetActive(id.clone()));
            }
        }
    }

    Ok(out)
}

fn check_parent(shadow: &BTreeMap<NodeId, FileNode>, parent: Option<&str>) -> Result<(), ModelError> {
    let Some(parent) = parent else {
        return Ok(());
    };
    match shadow.get(parent) {
        None => Err(ModelError::UnknownNode(parent.to_string())),
        Some(node) if !node.is_folder() => Err(ModelError::NotAFolder(parent.to_string())),
        Some(_) => Ok(()),
    }
}

fn file_body<'a>(
    shadow: &'a mut BTreeMap<NodeId, FileNode>,
    id: &str,
) -> Result<&'a mut String, ModelError> {
    let node = shadow
        .get_mut(id)
        .ok_or_else(|| ModelError::UnknownNode(id.to_string()))?;
    node.content
        .as_mut()
        .ok_or_else(|| ModelError::NotAFile(id.to_string()))
}

fn check_range(id: &str, body: &str, index: u32, len: u32) -> Result<(), ModelError> {
    let end = index.saturating_add(len);
    let ok = (end as usize) <= body.len()
        && body.is_char_boundary(index as usize)
        && body.is_char_boundary(end as usize);
    if ok {
        Ok(())
    } else {
        Err(ModelError::OutOfRange {
            id: id.to_string(),
            index,
            end,
            len: body.len() as u32,
        })
    }
}

/// `root` and every node below it, using a parent→children index over the shadow.
fn subtree(shadow: &BTreeMap<NodeId, FileNode>, root: &str) -> Vec<NodeId> {
    let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in shadow.values() {
        if let Some(parent) = node.parent_id.as_deref() {
            index.entry(parent).or_default().push(node.id.as_str());
        }
    }
    let mut out = vec![root.to_string()];
    let mut stack = vec![root];
    while let Some(next) = stack.pop() {
        if let Some(children) = index.get(next) {
            for child in children {
                out.push(child.to_string());
                stack.push(child);
            }
        }
    }
    out
}

fn execute(roots: &Roots, txn: &mut TransactionMut, mutation: &Mutation) {
    match mutation {
        Mutation::PutNode {
            id,
            kind,
            name,
            parent_id,
            content,
        } => {
            roots.kinds.insert(txn, id.as_str(), kind.as_str().to_string());
            roots.names.insert(txn, id.as_str(), name.clone());
            put_parent(roots, txn, id, parent_id.as_deref());
            if *kind == NodeKind::File && !content.is_empty() {
                let text = txn.get_or_insert_text(text_name(id).as_str());
                text.insert(txn, 0, content);
            }
        }
        Mutation::SetName { id, name } => {
            roots.names.insert(txn, id.as_str(), name.clone());
        }
        Mutation::SetParent { id, parent_id } => {
            put_parent(roots, txn, id, parent_id.as_deref());
        }
        Mutation::Insert { id, index, text } => {
            let body = txn.get_or_insert_text(text_name(id).as_str());
            body.insert(txn, *index, text);
        }
        Mutation::Remove { id, index, len } => {
            let body = txn.get_or_insert_text(text_name(id).as_str());
            body.remove_range(txn, *index, *len);
        }
        Mutation::DropNode { id, kind } => {
            roots.kinds.remove(txn, id);
            roots.names.remove(txn, id);
            roots.parents.remove(txn, id);
            if *kind == NodeKind::File {
                if let Some(body) = txn.get_text(text_name(id).as_str()) {
                    let len = body.len(&*txn);
                    if len > 0 {
                        body.remove_range(txn, 0, len);
                    }
                }
            }
        }
        Mutation::SetActive(id) => {
            roots.meta.insert(txn, ACTIVE_KEY, id.clone());
        }
        Mutation::ClearActive => {
            roots.meta.remove(txn, ACTIVE_KEY);
        }
    }
}

fn put_parent(roots: &Roots, txn: &mut TransactionMut, id: &str, parent: Option<&str>) {
    match parent {
        Some(parent) => {
            roots.parents.insert(txn, id, parent.to_string());
        }
        None => {
            roots.parents.insert(txn, id, Any::Null);
        }
    }
}

fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn materialize(doc: &Doc, roots: &Roots) -> FileTree {
    let txn = doc.transact();
    let ids: Vec<String> = roots.kinds.keys(&txn).map(|k| k.to_string()).collect();
    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(kind) = read_string(&roots.kinds, &txn, &id).and_then(|k| NodeKind::parse(&k))
        else {
            log::warn!("Skipping node {id} with unreadable kind");
            continue;
        };
        let name = read_string(&roots.names, &txn, &id).unwrap_or_default();
        let parent = read_string(&roots.parents, &txn, &id);
        let node = match kind {
            NodeKind::File => {
                let content = txn
                    .get_text(text_name(&id).as_str())
                    .map(|body| body.get_string(&txn))
                    .unwrap_or_default();
                FileNode::file(id, name, parent, content)
            }
            NodeKind::Folder => FileNode::folder(id, name, parent),
        };
        nodes.push(node);
    }
    let active = read_string(&roots.meta, &txn, ACTIVE_KEY);
    FileTree::from_nodes(nodes, active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model(n: u128) -> DocumentModel {
        DocumentModel::with_peer_id(Uuid::from_u128(n))
    }

    fn create_file(id: &str, parent: Option<&str>, content: &str) -> FileOp {
        FileOp::CreateFile {
            id: id.into(),
            name: format!("{id}.tex"),
            parent_id: parent.map(str::to_string),
            content: content.into(),
        }
    }

    fn create_folder(id: &str, parent: Option<&str>) -> FileOp {
        FileOp::CreateFolder {
            id: id.into(),
            name: id.into(),
            parent_id: parent.map(str::to_string),
        }
    }

    fn content(model: &DocumentModel, id: &str) -> Option<String> {
        model.snapshot().get(id).and_then(|n| n.content.clone())
    }

    #[test]
    fn test_create_file_generates_update() {
        let m = model(1);
        let update = m.apply_local(create_file("a", None, "hello")).unwrap();
        assert!(!update.is_empty());
        assert_eq!(content(&m, "a").as_deref(), Some("hello"));
        assert_eq!(m.snapshot().len(), 1);
    }

    #[test]
    fn test_remote_update_converges() {
        let a = model(1);
        let b = model(2);
        let update = a.apply_local(create_file("x", None, "shared")).unwrap();
        b.apply_remote(&update, Origin::Remote).unwrap();
        assert_eq!(*a.snapshot(), *b.snapshot());
    }

    #[test]
    fn test_concurrent_inserts_converge_in_any_order() {
        let a = model(1);
        let b = model(2);
        let c = model(3);
        let base = a.apply_local(create_file("f", None, "ab")).unwrap();
        b.apply_remote(&base, Origin::Remote).unwrap();
        c.apply_remote(&base, Origin::Remote).unwrap();

        let ua = a
            .apply_local(FileOp::InsertText { id: "f".into(), index: 1, text: "X".into() })
            .unwrap();
        let ub = b
            .apply_local(FileOp::InsertText { id: "f".into(), index: 1, text: "Y".into() })
            .unwrap();

        a.apply_remote(&ub, Origin::Remote).unwrap();
        b.apply_remote(&ua, Origin::Remote).unwrap();
        // Reverse order on a third replica.
        c.apply_remote(&ub, Origin::Remote).unwrap();
        c.apply_remote(&ua, Origin::Remote).unwrap();

        let text = content(&a, "f").unwrap();
        assert_eq!(text.len(), 4);
        assert_eq!(content(&b, "f").unwrap(), text);
        assert_eq!(content(&c, "f").unwrap(), text);
    }

    #[test]
    fn test_client_id_uses_whole_peer_id() {
        let low = Uuid::from_u128(7);
        let high = Uuid::from_u128(7 | (1 << 100));
        assert_ne!(client_id(low), client_id(high));
        assert_eq!(client_id(low), client_id(Uuid::from_u128(7)));
        for id in [low, high, Uuid::from_u128(u128::MAX), Uuid::nil()] {
            assert!(client_id(id) <= MAX_CLIENT_ID);
        }
    }

    #[test]
    fn test_peers_sharing_low_bits_keep_both_inserts() {
        let a = model(5);
        let b = model(5 | (1 << 64));
        let base = a.apply_local(create_file("f", None, "ab")).unwrap();
        b.apply_remote(&base, Origin::Remote).unwrap();

        let ua = a
            .apply_local(FileOp::InsertText { id: "f".into(), index: 1, text: "X".into() })
            .unwrap();
        let ub = b
            .apply_local(FileOp::InsertText { id: "f".into(), index: 1, text: "Y".into() })
            .unwrap();
        a.apply_remote(&ub, Origin::Remote).unwrap();
        b.apply_remote(&ua, Origin::Remote).unwrap();

        let text = content(&a, "f").unwrap();
        assert_eq!(text.len(), 4);
        assert_eq!(content(&b, "f").unwrap(), text);
    }

    /// xorshift64*, enough for reproducible shuffles.
    struct Shuffler(u64);

    impl Shuffler {
        fn below(&mut self, bound: usize) -> usize {
            self.0 ^= self.0 >> 12;
            self.0 ^= self.0 << 25;
            self.0 ^= self.0 >> 27;
            (self.0.wrapping_mul(0x2545_f491_4f6c_dd1d) % bound as u64) as usize
        }

        fn shuffle<T>(&mut self, items: &mut [T]) {
            for i in (1..items.len()).rev() {
                let j = self.below(i + 1);
                items.swap(i, j);
            }
        }
    }

    #[test]
    fn test_random_interleavings_converge() {
        for seed in 1..=25u64 {
            let mut rng = Shuffler(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
            let replicas: Vec<DocumentModel> = (1..=3).map(model).collect();
            let base = replicas[0].apply_local(create_file("f", None, "base text")).unwrap();
            for replica in &replicas[1..] {
                replica.apply_remote(&base, Origin::Remote).unwrap();
            }

            // Each replica edits on its own before hearing from the others.
            let mut updates = Vec::new();
            for round in 0..12 {
                let who = rng.below(replicas.len());
                let replica = &replicas[who];
                let len = content(replica, "f").map_or(0, |c| c.len());
                let op = match rng.below(4) {
                    0 => FileOp::InsertText {
                        id: "f".into(),
                        index: rng.below(len + 1) as u32,
                        text: format!("<{who}.{round}>"),
                    },
                    1 if len > 0 => {
                        let index = rng.below(len);
                        FileOp::DeleteText {
                            id: "f".into(),
                            index: index as u32,
                            len: (len - index).min(3) as u32,
                        }
                    }
                    2 => FileOp::Rename {
                        id: "f".into(),
                        name: format!("r{who}-{round}.tex"),
                    },
                    _ => create_file(&format!("n{who}-{round}"), None, "x"),
                };
                updates.push(replica.apply_local(op).unwrap());
            }

            // Every replica receives everything, each in its own order.
            for replica in &replicas {
                let mut order = updates.clone();
                rng.shuffle(&mut order);
                for update in &order {
                    replica.apply_remote(update, Origin::Remote).unwrap();
                }
            }

            let expected = replicas[0].snapshot();
            for replica in &replicas[1..] {
                assert_eq!(*replica.snapshot(), *expected, "seed {seed}");
            }
        }
    }

    #[test]
    fn test_concurrent_rename_last_writer_converges() {
        let a = model(1);
        let b = model(2);
        let base = a.apply_local(create_file("f", None, "")).unwrap();
        b.apply_remote(&base, Origin::Remote).unwrap();

        let ua = a.apply_local(FileOp::Rename { id: "f".into(), name: "left.tex".into() }).unwrap();
        let ub = b.apply_local(FileOp::Rename { id: "f".into(), name: "right.tex".into() }).unwrap();
        a.apply_remote(&ub, Origin::Remote).unwrap();
        b.apply_remote(&ua, Origin::Remote).unwrap();

        assert_eq!(*a.snapshot(), *b.snapshot());
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let a = model(1);
        let b = model(2);
        let update = a.apply_local(create_file("f", None, "once")).unwrap();
        b.apply_remote(&update, Origin::Remote).unwrap();
        b.apply_remote(&update, Origin::Remote).unwrap();
        assert_eq!(content(&b, "f").as_deref(), Some("once"));
    }

    #[test]
    fn test_delete_folder_removes_descendants() {
        let m = model(1);
        m.apply_batch(
            &[
                create_folder("f", None),
                create_folder("g", Some("f")),
                create_file("a", Some("g"), "deep"),
                create_file("b", None, "top"),
            ],
            Origin::Local,
        )
        .unwrap();

        m.apply_local(FileOp::Delete { id: "f".into() }).unwrap();
        let tree = m.snapshot();
        assert_eq!(tree.len(), 1);
        assert!(tree.contains("b"));
    }

    #[test]
    fn test_delete_replicates() {
        let a = model(1);
        let b = model(2);
        let u1 = a.apply_local(create_file("f", None, "bye")).unwrap();
        b.apply_remote(&u1, Origin::Remote).unwrap();
        let u2 = a.apply_local(FileOp::Delete { id: "f".into() }).unwrap();
        b.apply_remote(&u2, Origin::Remote).unwrap();
        assert!(b.snapshot().is_empty());
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let m = model(1);
        let err = m
            .apply_batch(
                &[create_file("a", None, ""), create_file("b", Some("missing"), "")],
                Origin::Local,
            )
            .unwrap_err();
        assert_eq!(err, ModelError::UnknownNode("missing".into()));
        assert!(m.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let m = model(1);
        m.apply_batch(&[create_file("a", None, "abc"), create_folder("f", None)], Origin::Local)
            .unwrap();

        assert!(matches!(
            m.apply_local(create_file("a", None, "")),
            Err(ModelError::DuplicateNode(_))
        ));
        assert!(matches!(
            m.apply_local(create_file("c", Some("a"), "")),
            Err(ModelError::NotAFolder(_))
        ));
        assert!(matches!(
            m.apply_local(FileOp::InsertText { id: "f".into(), index: 0, text: "x".into() }),
            Err(ModelError::NotAFile(_))
        ));
        assert!(matches!(
            m.apply_local(FileOp::DeleteText { id: "a".into(), index: 2, len: 5 }),
            Err(ModelError::OutOfRange { .. })
        ));
        assert!(matches!(
            m.apply_local(FileOp::SetActive { id: "f".into() }),
            Err(ModelError::NotAFile(_))
        ));
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let m = model(1);
        m.apply_batch(&[create_folder("f", None), create_folder("g", Some("f"))], Origin::Local)
            .unwrap();
        let err = m
            .apply_local(FileOp::Move { id: "f".into(), parent_id: Some("g".into()) })
            .unwrap_err();
        assert!(matches!(err, ModelError::WouldCycle { .. }));
    }

    #[test]
    fn test_text_edits() {
        let m = model(1);
        m.apply_local(create_file("a", None, "hello world")).unwrap();
        m.apply_local(FileOp::DeleteText { id: "a".into(), index: 5, len: 6 }).unwrap();
        m.apply_local(FileOp::InsertText { id: "a".into(), index: 5, text: ", folio".into() })
            .unwrap();
        assert_eq!(content(&m, "a").as_deref(), Some("hello, folio"));

        m.apply_local(FileOp::SetContent { id: "a".into(), content: "fresh".into() }).unwrap();
        assert_eq!(content(&m, "a").as_deref(), Some("fresh"));
    }

    #[test]
    fn test_subscribe_reports_delta() {
        let m = model(1);
        let seen: Arc<Mutex<Vec<ModelDelta>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = m.subscribe(move |delta| sink.lock().unwrap().push(delta.clone()));

        m.apply_local(create_file("a", None, "x")).unwrap();
        m.apply_local(FileOp::Delete { id: "a".into() }).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].upserted.contains("a"));
        assert_eq!(seen[0].origin, Origin::Local);
        assert!(seen[1].removed.contains_key("a"));
        assert_eq!(seen[1].removed["a"].content.as_deref(), Some("x"));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let m = model(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = m.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        m.apply_local(create_file("a", None, "")).unwrap();
        sub.unsubscribe();
        m.apply_local(create_file("b", None, "")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_active_only_delta_is_silent() {
        let m = model(1);
        m.apply_local(create_file("a", None, "")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = m.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        m.apply_local(FileOp::SetActive { id: "a".into() }).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(m.snapshot().active_file().map(|n| n.id.as_str()), Some("a"));
    }

    #[test]
    fn test_apply_if_empty_skips_populated_model() {
        let m = model(1);
        m.apply_local(create_file("peer", None, "from peer")).unwrap();
        let result = m
            .apply_if_empty(&[create_file("store", None, "from store")], Origin::Hydration)
            .unwrap();
        assert!(result.is_none());
        assert!(!m.snapshot().contains("store"));
    }

    #[test]
    fn test_state_vector_diff_handshake() {
        let a = model(1);
        let b = model(2);
        a.apply_local(create_file("a", None, "from a")).unwrap();
        b.apply_local(create_file("b", None, "from b")).unwrap();

        let diff_for_b = a.encode_diff(&b.state_vector()).unwrap();
        let diff_for_a = b.encode_diff(&a.state_vector()).unwrap();
        b.apply_remote(&diff_for_b, Origin::Remote).unwrap();
        a.apply_remote(&diff_for_a, Origin::Remote).unwrap();

        assert_eq!(*a.snapshot(), *b.snapshot());
        assert_eq!(a.snapshot().len(), 2);
    }

    #[test]
    fn test_on_update_sees_local_and_remote() {
        let a = model(1);
        let b = model(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = b.on_update(move |bytes, origin| {
            assert!(!bytes.is_empty());
            sink.lock().unwrap().push(origin);
        });
        let update = a.apply_local(create_file("a", None, "x")).unwrap();
        b.apply_remote(&update, Origin::Remote).unwrap();
        b.apply_local(create_file("b", None, "y")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Origin::Remote, Origin::Local]);
    }

    #[test]
    fn test_full_state_restores_replica() {
        let a = model(1);
        a.apply_batch(&[create_folder("f", None), create_file("x", Some("f"), "body")], Origin::Local)
            .unwrap();
        let b = model(2);
        b.apply_remote(&a.encode_state(), Origin::Cache).unwrap();
        assert_eq!(*a.snapshot(), *b.snapshot());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let m = model(1);
        assert!(matches!(
            m.apply_remote(&[0xFF, 0xFE, 0xFD], Origin::Remote),
            Err(ModelError::Decode(_))
        ));
    }
}
