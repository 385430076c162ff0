//! Changed-but-not-yet-flushed nodes.

use std::collections::{BTreeMap, HashMap};

use folio_core::{FileNode, ModelDelta, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Send the node's state as of flush time.
    Upsert,
    /// Remove from the store; carries the last known node for ordering.
    Delete(FileNode),
}

/// Pending changes keyed by node id. A delete replaces an earlier upsert;
/// an upsert after a delete (re-creation) replaces the delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChangeSet {
    changes: BTreeMap<NodeId, Change>,
}

impl PendingChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one model delta into the set.
    pub fn record(&mut self, delta: &ModelDelta) {
        for (id, node) in &delta.removed {
            self.changes.insert(id.clone(), Change::Delete(node.clone()));
        }
        for id in &delta.upserted {
            self.changes.insert(id.clone(), Change::Upsert);
        }
    }

    pub fn upsert(&mut self, id: impl Into<NodeId>) {
        self.changes.insert(id.into(), Change::Upsert);
    }

    pub fn delete(&mut self, node: FileNode) {
        self.changes.insert(node.id.clone(), Change::Delete(node));
    }

    /// Put a failed change back unless a newer change for the same id
    /// arrived meanwhile.
    pub fn requeue(&mut self, id: NodeId, change: Change) {
        self.changes.entry(id).or_insert(change);
    }

    pub fn get(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.changes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Take everything, leaving the set empty.
    pub fn take(&mut self) -> PendingChangeSet {
        std::mem::take(self)
    }

    /// Split into upsert ids and deleted nodes.
    pub fn into_parts(self) -> (Vec<NodeId>, Vec<FileNode>) {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (id, change) in self.changes {
            match change {
                Change::Upsert => upserts.push(id),
                Change::Delete(node) => deletes.push(node),
            }
        }
        (upserts, deletes)
    }
}

/// Order deleted nodes children-before-parents.
///
/// Walks a parent→children index built from the deleted nodes only, in
/// post-order, so a node is listed after everything beneath it.
pub fn delete_order(nodes: &[FileNode]) -> Vec<NodeId> {
    let present: HashMap<&str, &FileNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots = Vec::new();
    for node in nodes {
        match node.parent_id.as_deref().filter(|p| present.contains_key(p)) {
            Some(parent) => children.entry(parent).or_default().push(&node.id),
            None => roots.push(node.id.as_str()),
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    // (id, children already pushed)
    let mut stack: Vec<(&str, bool)> = roots.into_iter().rev().map(|id| (id, false)).collect();
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id.to_string());
            continue;
        }
        stack.push((id, true));
        if let Some(kids) = children.get(id) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, false)));
        }
    }
    order
}
