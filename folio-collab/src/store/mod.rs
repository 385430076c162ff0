//! Client side of the project storage API.
//!
//! ```text
//! GET    /projects/{room}          -> {project, files[]} | 404 | 401 | 403
//! POST   /projects/{room}          {name}                         -> {project, files[]}
//! POST   /projects/{room}/files    {id, name, type, parentId, content}
//! PATCH  /projects/{room}/files    {fileId, updates: {name?, content?, parentId?}}
//! DELETE /projects/{room}/files    {fileId}
//! GET    /projects                 -> 200 when the session is authenticated
//! GET    /projects/{room}/content  -> {content}
//! POST   /projects/{room}/content  {content}   first save of a single-file project
//! PATCH  /projects/{room}/content  {content}
//! ```
//!
//! [`HttpStore`] talks to the real service; [`MemoryStore`] keeps everything
//! in memory and records each call.

use async_trait::async_trait;
use folio_core::{FileNode, NodeId, NodeKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::{MemoryStore, StoreCall};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("project not found")]
    NotFound,
    #[error("not authenticated")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,
    /// Transport failure or unreadable response body.
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("server failure (HTTP {0})")]
    ServerFailure(u16),
}

impl StorageError {
    /// Map a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => StorageError::Unauthorized,
            403 => StorageError::Forbidden,
            404 => StorageError::NotFound,
            other => StorageError::ServerFailure(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// A file row as the store sends and receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    /// Omitted by some responses (e.g. project creation); files then start empty.
    #[serde(default)]
    pub content: Option<String>,
}

impl StoredFile {
    pub fn into_node(self) -> FileNode {
        match self.kind {
            NodeKind::File => {
                FileNode::file(self.id, self.name, self.parent_id, self.content.unwrap_or_default())
            }
            NodeKind::Folder => FileNode::folder(self.id, self.name, self.parent_id),
        }
    }
}

impl StoredFile {
    /// Whether this row already holds what `node` holds. A file row without
    /// content is compared on name, kind and parent only.
    pub fn matches(&self, node: &FileNode) -> bool {
        let content_matches = match (self.kind, &self.content) {
            (NodeKind::File, Some(content)) => node.content.as_deref() == Some(content.as_str()),
            _ => true,
        };
        self.id == node.id
            && self.name == node.name
            && self.kind == node.kind
            && self.parent_id == node.parent_id
            && content_matches
    }
}

impl From<&FileNode> for StoredFile {
    fn from(node: &FileNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            kind: node.kind,
            parent_id: node.parent_id.clone(),
            content: node.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: ProjectInfo,
    #[serde(default)]
    pub files: Vec<StoredFile>,
}

/// Partial update of one file. `None` fields are left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// `Some(None)` moves the file to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Option<NodeId>>,
}

impl FileUpdate {
    /// Every field of `node`; the reconciler always sends the latest full state.
    pub fn from_node(node: &FileNode) -> Self {
        Self {
            name: Some(node.name.clone()),
            content: node.content.clone(),
            parent_id: Some(node.parent_id.clone()),
        }
    }
}

/// Operations the reconciler and the session need from the store.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn fetch_project(&self, room: &str) -> Result<ProjectSnapshot, StorageError>;

    /// Create the project; the store adds its default file.
    async fn create_project(&self, room: &str, name: &str) -> Result<ProjectSnapshot, StorageError>;

    async fn create_file(&self, room: &str, file: &StoredFile) -> Result<(), StorageError>;

    async fn update_file(
        &self,
        room: &str,
        file_id: &str,
        updates: &FileUpdate,
    ) -> Result<(), StorageError>;

    async fn delete_file(&self, room: &str, file_id: &str) -> Result<(), StorageError>;

    /// Whether the current session is signed in.
    async fn is_authenticated(&self) -> bool;

    /// Whole-document text, for single-file projects.
    async fn fetch_content(&self, room: &str) -> Result<String, StorageError>;

    /// Write the whole-document text. `create` POSTs the first version;
    /// later saves PATCH.
    async fn save_content(
        &self,
        room: &str,
        content: &str,
        create: bool,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StorageError::from_status(401), StorageError::Unauthorized);
        assert_eq!(StorageError::from_status(403), StorageError::Forbidden);
        assert_eq!(StorageError::from_status(404), StorageError::NotFound);
        assert_eq!(StorageError::from_status(500), StorageError::ServerFailure(500));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let body = r#"{
            "project": {"id": "p1", "roomId": "thesis", "name": "Thesis", "ownerId": "u1"},
            "files": [
                {"id": "f", "name": "chapters", "type": "folder", "parentId": null},
                {"id": "a", "name": "intro.tex", "type": "file", "parentId": "f", "content": "hi"},
                {"id": "m", "name": "main.tex", "type": "file", "path": "/main.tex"}
            ]
        }"#;
        let snapshot: ProjectSnapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snapshot.project.room_id, "thesis");
        let nodes: Vec<FileNode> = snapshot.files.into_iter().map(StoredFile::into_node).collect();
        assert_eq!(nodes[0], FileNode::folder("f", "chapters", None));
        assert_eq!(nodes[1], FileNode::file("a", "intro.tex", Some("f".into()), "hi"));
        // Missing content on a file becomes an empty body.
        assert_eq!(nodes[2].content.as_deref(), Some(""));
    }

    #[test]
    fn test_file_update_serialization() {
        let moved_to_root = FileUpdate {
            parent_id: Some(None),
            ..FileUpdate::default()
        };
        assert_eq!(serde_json::to_string(&moved_to_root).unwrap(), r#"{"parentId":null}"#);

        let full = FileUpdate::from_node(&FileNode::file("a", "a.tex", Some("f".into()), "x"));
        assert_eq!(
            serde_json::to_value(&full).unwrap(),
            serde_json::json!({"name": "a.tex", "content": "x", "parentId": "f"})
        );
    }

    #[test]
    fn test_row_matches_node() {
        let node = FileNode::file("a", "a.tex", Some("f".into()), "x");
        let row = StoredFile::from(&node);
        assert!(row.matches(&node));

        let stale = StoredFile {
            content: Some("old".into()),
            ..row.clone()
        };
        assert!(!stale.matches(&node));
        let moved = StoredFile {
            parent_id: None,
            ..row.clone()
        };
        assert!(!moved.matches(&node));
        let no_content = StoredFile {
            content: None,
            ..row
        };
        assert!(no_content.matches(&node));
    }
}
