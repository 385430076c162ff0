//! # folio-core — replicated project model for Folio
//!
//! A Folio project is a tree of named folders and text files edited by many
//! peers at once. Every peer holds a replica of the tree inside a Yrs document;
//! replicas that have seen the same updates materialize the same tree,
//! whatever order the updates arrived in.
//!
//! ## Modules
//!
//! - [`collab`] — `DocumentModel`: CRDT-backed file tree, local/remote apply, subscriptions
//! - [`tree`] — `FileTree`: read-only materialized snapshot with a parent→children index
//! - [`awareness`] — ephemeral per-peer presence (name, color, cursor)
//! - [`error`] — model errors

use serde::{Deserialize, Serialize};

pub mod awareness;
pub mod collab;
pub mod error;
pub mod tree;

pub use awareness::{Awareness, AwarenessMessage, AwarenessState, Cursor};
pub use collab::{DocumentModel, FileOp, ModelDelta, Origin, Subscription};
pub use error::ModelError;
pub use tree::FileTree;

/// Identifier of a file or folder. Stable across replicas and the backing store.
pub type NodeId = String;

/// Name given to the single file of a freshly created project.
pub const DEFAULT_FILE_NAME: &str = "main.tex";

/// Node id used when a replica seeds the built-in default document locally.
///
/// Fixed so that peers seeding concurrently write the same key.
pub const DEFAULT_FILE_ID: &str = "main";

/// Whether a node holds text or other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(NodeKind::File),
            "folder" => Some(NodeKind::Folder),
            _ => None,
        }
    }
}

/// A materialized file or folder.
///
/// `content` is `Some` exactly when `kind` is [`NodeKind::File`]; the
/// constructors are the only way the model builds nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub content: Option<String>,
}

impl FileNode {
    pub fn file(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        parent_id: Option<NodeId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::File,
            parent_id,
            content: Some(content.into()),
        }
    }

    pub fn folder(id: impl Into<NodeId>, name: impl Into<String>, parent_id: Option<NodeId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Folder,
            parent_id,
            content: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// LaTeX body used for new projects and for replicas that cannot reach the store.
pub fn default_document(title: &str, author: &str) -> String {
    format!(
        "\\documentclass{{article}}
\\usepackage{{graphicx}}
\\usepackage{{amsmath}}

\\title{{{title}}}
\\author{{{author}}}
\\date{{\\today}}

\\begin{{document}}

\\maketitle

\\section{{Introduction}}
Start writing your LaTeX document here...

\\end{{document}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_strings() {
        assert_eq!(NodeKind::File.as_str(), "file");
        assert_eq!(NodeKind::parse("folder"), Some(NodeKind::Folder));
        assert_eq!(NodeKind::parse("symlink"), None);
    }

    #[test]
    fn test_content_only_on_files() {
        let file = FileNode::file("a", "a.tex", None, "x");
        let folder = FileNode::folder("f", "chapters", None);
        assert!(file.content.is_some());
        assert!(folder.content.is_none());
        assert!(file.is_file());
        assert!(folder.is_folder());
    }

    #[test]
    fn test_default_document_title() {
        let body = default_document("Thesis", "Ada");
        assert!(body.starts_with("\\documentclass{article}"));
        assert!(body.contains("\\title{Thesis}"));
        assert!(body.contains("\\author{Ada}"));
        assert!(body.ends_with("\\end{document}"));
    }
}
