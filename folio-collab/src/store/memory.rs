//! In-memory [`StorageClient`] that records every call.
//!
//! Used by the integration tests and for running a session without a backend.
//! Failures can be injected per operation or per file.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use folio_core::{default_document, NodeId, NodeKind, DEFAULT_FILE_NAME};

use super::{FileUpdate, ProjectInfo, ProjectSnapshot, StorageClient, StorageError, StoredFile};

/// One recorded call, in the order it reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    FetchProject { room: String },
    CreateProject { room: String, name: String },
    CreateFile { room: String, id: NodeId },
    UpdateFile { room: String, id: NodeId, content: Option<String> },
    DeleteFile { room: String, id: NodeId },
    IsAuthenticated,
    FetchContent { room: String },
    SaveContent { room: String, create: bool, content: String },
}

impl StoreCall {
    /// File id for file-level calls.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            StoreCall::CreateFile { id, .. }
            | StoreCall::UpdateFile { id, .. }
            | StoreCall::DeleteFile { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreCall::CreateProject { .. }
                | StoreCall::CreateFile { .. }
                | StoreCall::UpdateFile { .. }
                | StoreCall::DeleteFile { .. }
                | StoreCall::SaveContent { .. }
        )
    }
}

struct Project {
    info: ProjectInfo,
    files: BTreeMap<NodeId, StoredFile>,
    content: String,
}

struct FileFailure {
    error: StorageError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    calls: Vec<StoreCall>,
    authenticated: bool,
    fetch_failure: Option<StorageError>,
    file_failures: HashMap<NodeId, FileFailure>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryStore {
    /// Empty store with an authenticated session.
    pub fn new() -> Self {
        let store = Self::default();
        store.lock().authenticated = true;
        store
    }

    /// Sleep this long (on the tokio clock) inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.lock().authenticated = authenticated;
    }

    /// Seed a project directly, bypassing the call log.
    pub fn insert_project(&self, room: &str, name: &str, files: Vec<StoredFile>) {
        let project = Project {
            info: ProjectInfo {
                id: format!("project-{room}"),
                room_id: room.to_string(),
                name: name.to_string(),
                owner_id: None,
            },
            files: files.into_iter().map(|f| (f.id.clone(), f)).collect(),
            content: String::new(),
        };
        self.lock().projects.insert(room.to_string(), project);
    }

    /// Make `fetch_project` fail with `error` until cleared.
    pub fn fail_fetch(&self, error: Option<StorageError>) {
        self.lock().fetch_failure = error;
    }

    /// Make writes to `file_id` fail; content saves are keyed by room.
    /// `times: None` fails until cleared.
    pub fn fail_file(&self, file_id: &str, error: StorageError, times: Option<u32>) {
        self.lock().file_failures.insert(
            file_id.to_string(),
            FileFailure {
                error,
                remaining: times,
            },
        );
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fetch_failure = None;
        inner.file_failures.clear();
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Write calls only, in order.
    pub fn writes(&self) -> Vec<StoreCall> {
        self.lock().calls.iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn file(&self, room: &str, id: &str) -> Option<StoredFile> {
        self.lock()
            .projects
            .get(room)
            .and_then(|p| p.files.get(id).cloned())
    }

    pub fn files(&self, room: &str) -> Vec<StoredFile> {
        self.lock()
            .projects
            .get(room)
            .map(|p| p.files.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Content column of a single-file project.
    pub fn content(&self, room: &str) -> Option<String> {
        self.lock().projects.get(room).map(|p| p.content.clone())
    }

    /// Seed the content column, bypassing the call log.
    pub fn set_content(&self, room: &str, content: &str) {
        if let Some(project) = self.lock().projects.get_mut(room) {
            project.content = content.to_string();
        }
    }

    pub fn has_project(&self, room: &str) -> bool {
        self.lock().projects.contains_key(room)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_file_failure(inner: &mut Inner, id: &str) -> Option<StorageError> {
        let failure = inner.file_failures.get_mut(id)?;
        if failure.remaining == Some(0) {
            inner.file_failures.remove(id);
            return None;
        }
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Some(failure.error.clone())
    }

    /// Record `call` and run the shared auth/failure/project checks for a file write.
    fn begin_file_write<'a>(
        inner: &'a mut Inner,
        call: StoreCall,
        room: &str,
        id: &str,
    ) -> Result<&'a mut Project, StorageError> {
        inner.calls.push(call);
        if !inner.authenticated {
            return Err(StorageError::Unauthorized);
        }
        if let Some(error) = Self::take_file_failure(inner, id) {
            return Err(error);
        }
        inner.projects.get_mut(room).ok_or(StorageError::NotFound)
    }
}

fn snapshot_of(project: &Project) -> ProjectSnapshot {
    ProjectSnapshot {
        project: project.info.clone(),
        files: project.files.values().cloned().collect(),
    }
}

#[async_trait]
impl StorageClient for MemoryStore {
    async fn fetch_project(&self, room: &str) -> Result<ProjectSnapshot, StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::FetchProject { room: room.to_string() });
        if let Some(error) = inner.fetch_failure.clone() {
            return Err(error);
        }
        inner
            .projects
            .get(room)
            .map(snapshot_of)
            .ok_or(StorageError::NotFound)
    }

    async fn create_project(&self, room: &str, name: &str) -> Result<ProjectSnapshot, StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::CreateProject {
            room: room.to_string(),
            name: name.to_string(),
        });
        if !inner.authenticated {
            return Err(StorageError::Unauthorized);
        }
        inner.next_id += 1;
        let file_id = format!("file-{}", inner.next_id);
        let main = StoredFile {
            id: file_id.clone(),
            name: DEFAULT_FILE_NAME.to_string(),
            kind: NodeKind::File,
            parent_id: None,
            content: Some(default_document(name, "user")),
        };
        let project = Project {
            info: ProjectInfo {
                id: format!("project-{}", inner.next_id),
                room_id: room.to_string(),
                name: name.to_string(),
                owner_id: Some("user".to_string()),
            },
            files: BTreeMap::from([(file_id, main)]),
            content: String::new(),
        };
        let snapshot = snapshot_of(&project);
        inner.projects.insert(room.to_string(), project);
        Ok(snapshot)
    }

    async fn create_file(&self, room: &str, file: &StoredFile) -> Result<(), StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        let call = StoreCall::CreateFile {
            room: room.to_string(),
            id: file.id.clone(),
        };
        let project = Self::begin_file_write(&mut inner, call, room, &file.id)?;
        let mut stored = file.clone();
        if stored.kind == NodeKind::Folder {
            stored.content = None;
        }
        project.files.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn update_file(
        &self,
        room: &str,
        file_id: &str,
        updates: &FileUpdate,
    ) -> Result<(), StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        let call = StoreCall::UpdateFile {
            room: room.to_string(),
            id: file_id.to_string(),
            content: updates.content.clone(),
        };
        let project = Self::begin_file_write(&mut inner, call, room, file_id)?;
        if let Some(file) = project.files.get_mut(file_id) {
            if let Some(name) = &updates.name {
                file.name = name.clone();
            }
            if let Some(content) = &updates.content {
                file.content = Some(content.clone());
            }
            if let Some(parent_id) = &updates.parent_id {
                file.parent_id = parent_id.clone();
            }
        }
        Ok(())
    }

    async fn delete_file(&self, room: &str, file_id: &str) -> Result<(), StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        let call = StoreCall::DeleteFile {
            room: room.to_string(),
            id: file_id.to_string(),
        };
        let project = Self::begin_file_write(&mut inner, call, room, file_id)?;

        // Cascade like the real service.
        let mut stack = vec![file_id.to_string()];
        while let Some(id) = stack.pop() {
            stack.extend(
                project
                    .files
                    .values()
                    .filter(|f| f.parent_id.as_deref() == Some(id.as_str()))
                    .map(|f| f.id.clone()),
            );
            project.files.remove(&id);
        }
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        self.delay().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::IsAuthenticated);
        inner.authenticated
    }

    async fn fetch_content(&self, room: &str) -> Result<String, StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::FetchContent { room: room.to_string() });
        if let Some(error) = inner.fetch_failure.clone() {
            return Err(error);
        }
        inner
            .projects
            .get(room)
            .map(|p| p.content.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn save_content(
        &self,
        room: &str,
        content: &str,
        create: bool,
    ) -> Result<(), StorageError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::SaveContent {
            room: room.to_string(),
            create,
            content: content.to_string(),
        });
        if !inner.authenticated {
            return Err(StorageError::Unauthorized);
        }
        if let Some(error) = Self::take_file_failure(&mut inner, room) {
            return Err(error);
        }
        let project = inner.projects.get_mut(room).ok_or(StorageError::NotFound)?;
        project.content = content.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, parent: Option<&str>) -> StoredFile {
        StoredFile {
            id: id.into(),
            name: format!("{id}.tex"),
            kind: NodeKind::File,
            parent_id: parent.map(str::to_string),
            content: Some(String::new()),
        }
    }

    fn folder(id: &str) -> StoredFile {
        StoredFile {
            id: id.into(),
            name: id.into(),
            kind: NodeKind::Folder,
            parent_id: None,
            content: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_project() {
        let store = MemoryStore::new();
        assert_eq!(store.fetch_project("r").await, Err(StorageError::NotFound));
        assert_eq!(store.calls(), vec![StoreCall::FetchProject { room: "r".into() }]);
    }

    #[tokio::test]
    async fn test_create_project_adds_default_file() {
        let store = MemoryStore::new();
        let snapshot = store.create_project("r", "Untitled Project").await.unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.files[0].name, DEFAULT_FILE_NAME);
        assert!(store.has_project("r"));
    }

    #[tokio::test]
    async fn test_unauthenticated_writes_rejected() {
        let store = MemoryStore::new();
        store.set_authenticated(false);
        assert!(!store.is_authenticated().await);
        assert_eq!(
            store.create_project("r", "x").await,
            Err(StorageError::Unauthorized)
        );
        assert!(!store.has_project("r"));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        store.insert_project("r", "R", vec![folder("f"), file("a", Some("f")), file("b", None)]);
        store.delete_file("r", "f").await.unwrap();
        let left: Vec<String> = store.files("r").into_iter().map(|f| f.id).collect();
        assert_eq!(left, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_update_applies_fields() {
        let store = MemoryStore::new();
        store.insert_project("r", "R", vec![folder("f"), file("a", Some("f"))]);
        let updates = FileUpdate {
            content: Some("new".into()),
            parent_id: Some(None),
            ..FileUpdate::default()
        };
        store.update_file("r", "a", &updates).await.unwrap();
        let a = store.file("r", "a").unwrap();
        assert_eq!(a.content.as_deref(), Some("new"));
        assert_eq!(a.parent_id, None);
    }

    #[tokio::test]
    async fn test_injected_file_failure_counts_down() {
        let store = MemoryStore::new();
        store.insert_project("r", "R", vec![]);
        store.fail_file("a", StorageError::ServerFailure(503), Some(1));
        assert_eq!(
            store.create_file("r", &file("a", None)).await,
            Err(StorageError::ServerFailure(503))
        );
        assert_eq!(store.create_file("r", &file("a", None)).await, Ok(()));
        assert_eq!(store.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_save_content_records_method() {
        let store = MemoryStore::new();
        store.insert_project("r", "R", vec![]);
        assert_eq!(store.fetch_content("r").await, Ok(String::new()));

        store.save_content("r", "first", true).await.unwrap();
        store.save_content("r", "second", false).await.unwrap();
        assert_eq!(store.content("r").as_deref(), Some("second"));
        let creates: Vec<bool> = store
            .writes()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::SaveContent { create, .. } => Some(create),
                _ => None,
            })
            .collect();
        assert_eq!(creates, vec![true, false]);
    }
}
