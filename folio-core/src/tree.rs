//! Read-only materialized view of a replica's file tree.
//!
//! Built from the CRDT state after every transaction. Concurrent moves and
//! deletes can leave a node pointing at a missing parent, at a file, or into a
//! cycle; such nodes are presented at the root. The rule only looks at
//! converged state, so every replica presents the same tree.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{FileNode, NodeId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileTree {
    nodes: BTreeMap<NodeId, FileNode>,
    /// Top-level node ids, sorted by (name, id).
    roots: Vec<NodeId>,
    /// Folder id → child ids, sorted by (name, id).
    children: HashMap<NodeId, Vec<NodeId>>,
    active: Option<NodeId>,
}

impl FileTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a tree from raw nodes, normalizing invalid parent links.
    pub fn from_nodes(nodes: impl IntoIterator<Item = FileNode>, active: Option<NodeId>) -> Self {
        let mut nodes: BTreeMap<NodeId, FileNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        normalize_parents(&mut nodes);

        let mut roots = Vec::new();
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes.values() {
            match &node.parent_id {
                Some(parent) => children.entry(parent.clone()).or_default().push(node.id.clone()),
                None => roots.push(node.id.clone()),
            }
        }
        let by_name = |a: &NodeId, b: &NodeId| {
            let (na, nb) = (&nodes[a], &nodes[b]);
            na.name.cmp(&nb.name).then_with(|| na.id.cmp(&nb.id))
        };
        roots.sort_by(by_name);
        for list in children.values_mut() {
            list.sort_by(by_name);
        }

        Self {
            nodes,
            roots,
            children,
            active,
        }
    }

    pub fn get(&self, id: &str) -> Option<&FileNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.values()
    }

    /// File-typed nodes in id order.
    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.values().filter(|n| n.is_file())
    }

    /// Direct children of `parent` (`None` = top level), sorted by name.
    pub fn children(&self, parent: Option<&str>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(id) => self.children.get(id).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// Transitive descendants of `id`, parents before children. Excludes `id`.
    pub fn descendants(&self, id: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<&NodeId> = self.children(Some(id)).iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next.clone());
            stack.extend(self.children(Some(next.as_str())).iter().rev());
        }
        out
    }

    /// Every node in pre-order (parents before children, siblings by name).
    pub fn walk(&self) -> Vec<&FileNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&NodeId> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(&self.nodes[id]);
            stack.extend(self.children(Some(id.as_str())).iter().rev());
        }
        out
    }

    /// Number of ancestors of `id` (0 for top-level nodes).
    pub fn depth(&self, id: &str) -> Option<usize> {
        let mut node = self.nodes.get(id)?;
        let mut depth = 0;
        while let Some(parent) = node.parent_id.as_deref() {
            node = self.nodes.get(parent)?;
            depth += 1;
        }
        Some(depth)
    }

    /// Slash-separated path from the root, e.g. `/chapters/intro.tex`.
    pub fn path(&self, id: &str) -> Option<String> {
        let mut segments = Vec::new();
        let mut node = self.nodes.get(id)?;
        loop {
            segments.push(node.name.as_str());
            match node.parent_id.as_deref() {
                Some(parent) => node = self.nodes.get(parent)?,
                None => break,
            }
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    /// First file in walk order.
    pub fn first_file(&self) -> Option<&FileNode> {
        self.walk().into_iter().find(|n| n.is_file())
    }

    /// Active file id as recorded in the replica, even if it no longer resolves.
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// The active file, if it still exists and is a file.
    pub fn active_file(&self) -> Option<&FileNode> {
        self.active
            .as_deref()
            .and_then(|id| self.nodes.get(id))
            .filter(|n| n.is_file())
    }

    pub fn into_nodes(self) -> BTreeMap<NodeId, FileNode> {
        self.nodes
    }
}

fn normalize_parents(nodes: &mut BTreeMap<NodeId, FileNode>) {
    let dangling: Vec<NodeId> = nodes
        .values()
        .filter(|n| match n.parent_id.as_deref() {
            None => false,
            Some(parent) => !nodes.get(parent).is_some_and(FileNode::is_folder),
        })
        .map(|n| n.id.clone())
        .collect();

    let mut cyclic = Vec::new();
    {
        let mut settled: HashSet<&str> = HashSet::new();
        for start in nodes.keys() {
            let mut path: Vec<&str> = Vec::new();
            let mut cursor = Some(start.as_str());
            while let Some(id) = cursor {
                if settled.contains(id) {
                    break;
                }
                if let Some(pos) = path.iter().position(|p| *p == id) {
                    cyclic.extend(path[pos..].iter().map(|s| s.to_string()));
                    break;
                }
                path.push(id);
                cursor = nodes
                    .get(id)
                    .and_then(|n| n.parent_id.as_deref())
                    .filter(|p| nodes.get(*p).is_some_and(FileNode::is_folder));
            }
            settled.extend(path);
        }
    }

    for id in dangling.into_iter().chain(cyclic) {
        if let Some(node) = nodes.get_mut(&id) {
            log::debug!("Presenting {} at root (parent {:?} unusable)", id, node.parent_id);
            node.parent_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileTree {
        FileTree::from_nodes(
            vec![
                FileNode::folder("f", "chapters", None),
                FileNode::folder("g", "figures", Some("f".into())),
                FileNode::file("a", "intro.tex", Some("f".into()), "intro"),
                FileNode::file("b", "plot.tex", Some("g".into()), "plot"),
                FileNode::file("m", "main.tex", None, "main"),
            ],
            Some("m".into()),
        )
    }

    #[test]
    fn test_children_sorted_by_name() {
        let tree = sample();
        assert_eq!(tree.children(None), &["f".to_string(), "m".to_string()]);
        assert_eq!(tree.children(Some("f")), &["g".to_string(), "a".to_string()]);
        assert!(tree.children(Some("a")).is_empty());
    }

    #[test]
    fn test_descendants_parents_first() {
        let tree = sample();
        assert_eq!(tree.descendants("f"), vec!["g", "b", "a"]);
        assert!(tree.descendants("m").is_empty());
    }

    #[test]
    fn test_path_and_depth() {
        let tree = sample();
        assert_eq!(tree.path("b").as_deref(), Some("/chapters/figures/plot.tex"));
        assert_eq!(tree.depth("b"), Some(2));
        assert_eq!(tree.depth("m"), Some(0));
        assert_eq!(tree.path("missing"), None);
    }

    #[test]
    fn test_first_and_active_file() {
        let tree = sample();
        assert_eq!(tree.first_file().map(|n| n.id.as_str()), Some("b"));
        assert_eq!(tree.active_file().map(|n| n.id.as_str()), Some("m"));

        let stale = FileTree::from_nodes(vec![FileNode::folder("f", "x", None)], Some("gone".into()));
        assert_eq!(stale.active_id(), Some("gone"));
        assert!(stale.active_file().is_none());
    }

    #[test]
    fn test_dangling_parent_presented_at_root() {
        let tree = FileTree::from_nodes(
            vec![
                FileNode::file("a", "a.tex", Some("ghost".into()), ""),
                FileNode::file("b", "b.tex", Some("a".into()), ""),
            ],
            None,
        );
        assert_eq!(tree.get("a").unwrap().parent_id, None);
        // Parent is a file, not a folder.
        assert_eq!(tree.get("b").unwrap().parent_id, None);
        assert_eq!(tree.children(None).len(), 2);
    }

    #[test]
    fn test_cycle_presented_at_root() {
        let tree = FileTree::from_nodes(
            vec![
                FileNode::folder("x", "x", Some("y".into())),
                FileNode::folder("y", "y", Some("x".into())),
                FileNode::file("z", "z.tex", Some("y".into()), ""),
            ],
            None,
        );
        assert_eq!(tree.get("x").unwrap().parent_id, None);
        assert_eq!(tree.get("y").unwrap().parent_id, None);
        assert_eq!(tree.get("z").unwrap().parent_id.as_deref(), Some("y"));
        assert_eq!(tree.walk().len(), 3);
    }
}
