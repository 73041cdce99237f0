//! Blob containers for the remote backend
//!
//! Reads against a missing container behave like reads of a missing blob. Writes and
//! listings against a missing container fail with `Error::ContainerNotFound`, which the
//! feed layer turns into an empty result for listings.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::storage::local_file::StorageFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Pending,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatus {
    pub state: CopyState,
    pub description: Option<String>,
}

impl CopyStatus {
    pub fn new(state: CopyState) -> Self {
        Self {
            state,
            description: None,
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{:?} ({})", self.state, description),
            None => write!(f, "{:?}", self.state),
        }
    }
}

/// One page of a segmented listing. `continuation` is `None` once exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Segment<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            continuation: None,
        }
    }
}

/// Cuts a sorted key listing into one segment after `continuation`.
fn segment_of<'a>(
    keys: impl Iterator<Item = &'a String>,
    prefix: &str,
    continuation: Option<&str>,
    page_size: usize,
) -> Segment<String> {
    let mut items: Vec<String> = keys
        .filter(|key| key.starts_with(prefix))
        .filter(|key| continuation.map_or(true, |token| key.as_str() > token))
        .take(page_size + 1)
        .cloned()
        .collect();

    let continuation = if items.len() > page_size {
        items.truncate(page_size);
        items.last().cloned()
    } else {
        None
    };

    Segment {
        items,
        continuation,
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns true when the container was created by this call
    async fn create_container_if_not_exists(&self, container: &str) -> Result<bool>;

    async fn delete_container(&self, container: &str) -> Result<bool>;

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, container: &str, blob: &str) -> Result<bool>;

    async fn get(&self, container: &str, blob: &str) -> Result<Option<Bytes>>;

    async fn put(&self, container: &str, blob: &str, content: Bytes) -> Result<()>;

    async fn delete(&self, container: &str, blob: &str) -> Result<bool>;

    /// Starts a server-side copy inside one container. Completion is observed
    /// through `copy_status` on the destination.
    async fn start_copy(&self, container: &str, source: &str, destination: &str) -> Result<()>;

    async fn copy_status(&self, container: &str, blob: &str) -> Result<Option<CopyStatus>>;

    /// Blob names starting with `prefix`, in lexical order
    async fn list_segmented(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<String>>;
}

#[derive(Debug, Clone)]
struct MemoryBlob {
    content: Bytes,
    copy_status: Option<CopyStatus>,
    pending_polls: u32,
}

/// In-memory object store.
///
/// Copies can be made to report `Pending` for a number of status polls, or to fail,
/// so callers' polling can be exercised.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    containers: Mutex<BTreeMap<String, BTreeMap<String, MemoryBlob>>>,
    copy_delay_polls: u32,
    copy_failure: Mutex<Option<CopyState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies stay pending for `polls` status queries
    pub fn with_copy_delay(polls: u32) -> Self {
        Self {
            copy_delay_polls: polls,
            ..Self::default()
        }
    }

    /// Makes subsequent copies end in `state` instead of success
    pub fn set_copy_failure(&self, state: Option<CopyState>) {
        *self
            .copy_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn containers(&self) -> MutexGuard<'_, BTreeMap<String, BTreeMap<String, MemoryBlob>>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_container_if_not_exists(&self, container: &str) -> Result<bool> {
        let mut containers = self.containers();
        if containers.contains_key(container) {
            return Ok(false);
        }
        containers.insert(container.to_string(), BTreeMap::new());
        Ok(true)
    }

    async fn delete_container(&self, container: &str) -> Result<bool> {
        Ok(self.containers().remove(container).is_some())
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .containers()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, container: &str, blob: &str) -> Result<bool> {
        Ok(self
            .containers()
            .get(container)
            .map_or(false, |blobs| blobs.contains_key(blob)))
    }

    async fn get(&self, container: &str, blob: &str) -> Result<Option<Bytes>> {
        Ok(self
            .containers()
            .get(container)
            .and_then(|blobs| blobs.get(blob))
            .map(|blob| blob.content.clone()))
    }

    async fn put(&self, container: &str, blob: &str, content: Bytes) -> Result<()> {
        let mut containers = self.containers();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        blobs.insert(
            blob.to_string(),
            MemoryBlob {
                content,
                copy_status: None,
                pending_polls: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, container: &str, blob: &str) -> Result<bool> {
        Ok(self
            .containers()
            .get_mut(container)
            .map_or(false, |blobs| blobs.remove(blob).is_some()))
    }

    async fn start_copy(&self, container: &str, source: &str, destination: &str) -> Result<()> {
        let failure = *self
            .copy_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut containers = self.containers();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        let content = blobs
            .get(source)
            .map(|blob| blob.content.clone())
            .ok_or_else(|| Error::CopyFailed {
                path: format!("{}/{}", container, source),
                status: "source not found".to_string(),
            })?;

        let state = failure.unwrap_or(CopyState::Success);
        blobs.insert(
            destination.to_string(),
            MemoryBlob {
                content,
                copy_status: Some(CopyStatus::new(state)),
                pending_polls: self.copy_delay_polls,
            },
        );
        Ok(())
    }

    async fn copy_status(&self, container: &str, blob: &str) -> Result<Option<CopyStatus>> {
        let mut containers = self.containers();
        let Some(blob) = containers
            .get_mut(container)
            .and_then(|blobs| blobs.get_mut(blob))
        else {
            return Ok(None);
        };

        if blob.pending_polls > 0 {
            blob.pending_polls -= 1;
            return Ok(Some(CopyStatus::new(CopyState::Pending)));
        }

        Ok(Some(
            blob.copy_status
                .clone()
                .unwrap_or_else(|| CopyStatus::new(CopyState::Success)),
        ))
    }

    async fn list_segmented(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<String>> {
        let containers = self.containers();
        let blobs = containers
            .get(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        Ok(segment_of(blobs.keys(), prefix, continuation, page_size))
    }
}

/// Object store kept as plain files, one directory per container.
///
/// Copies complete synchronously.
#[derive(Debug)]
pub struct DirectoryObjectStore {
    root_path: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        fs::create_dir_all(&root_path)?;
        info!("Using object store directory: {}", root_path.display());
        Ok(Self { root_path })
    }

    fn container_path(&self, container: &str) -> PathBuf {
        self.root_path.join(container)
    }

    fn existing_container(&self, container: &str) -> Result<PathBuf> {
        let path = self.container_path(container);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Error::ContainerNotFound(container.to_string()))
        }
    }

    /// Blob files prune their empty parents up to the container directory.
    fn blob_file(&self, container: &str, blob: &str) -> StorageFile {
        let depth = blob.matches('/').count();
        let path = blob
            .split('/')
            .fold(self.container_path(container), |path, part| path.join(part));
        StorageFile::new(path, depth)
    }

    fn collect_blobs(base: &Path, directory: &Path, names: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_blobs(base, &path, names)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                names.push(name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for DirectoryObjectStore {
    async fn create_container_if_not_exists(&self, container: &str) -> Result<bool> {
        let path = self.container_path(container);
        if path.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&path)?;
        debug!("Created container {}", container);
        Ok(true)
    }

    async fn delete_container(&self, container: &str) -> Result<bool> {
        match fs::remove_dir_all(self.container_path(container)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, container: &str, blob: &str) -> Result<bool> {
        Ok(self.blob_file(container, blob).exists())
    }

    async fn get(&self, container: &str, blob: &str) -> Result<Option<Bytes>> {
        self.blob_file(container, blob).read()
    }

    async fn put(&self, container: &str, blob: &str, content: Bytes) -> Result<()> {
        self.existing_container(container)?;
        self.blob_file(container, blob).write(&content)
    }

    async fn delete(&self, container: &str, blob: &str) -> Result<bool> {
        self.blob_file(container, blob).delete()
    }

    async fn start_copy(&self, container: &str, source: &str, destination: &str) -> Result<()> {
        self.existing_container(container)?;
        let source_file = self.blob_file(container, source);
        if !source_file.exists() {
            return Err(Error::CopyFailed {
                path: format!("{}/{}", container, source),
                status: "source not found".to_string(),
            });
        }
        source_file.copy_to(&self.blob_file(container, destination))
    }

    async fn copy_status(&self, container: &str, blob: &str) -> Result<Option<CopyStatus>> {
        Ok(self
            .blob_file(container, blob)
            .exists()
            .then(|| CopyStatus::new(CopyState::Success)))
    }

    async fn list_segmented(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<String>> {
        let path = self.existing_container(container)?;
        let mut names = Vec::new();
        Self::collect_blobs(&path, &path, &mut names)?;
        names.sort();
        Ok(segment_of(names.iter(), prefix, continuation, page_size))
    }
}
