//! Local filesystem storage backend
//!
//! Layout under the root, one directory per feed (`_` is the default feed):
//!
//! ```text
//! <feed>/.<state>/.users/<user>/<id[0]>/<id>/<version>/<id>.<version>.nupkg   payload
//! <feed>/.<state>/<id[0]>/<id>/<version>/<id>.<version>.txt                   owner marker
//! <feed>/<image[0]>/<image>.pdb/<hash>/<image>.pd_                            symbol
//! <feed>/<file[0]>/<file>/<hash>/<file>                                        source
//! <content dir>/.packages/<id>/<version>.txt                                   reference set
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{normalize_feed_name, PackageName, PackageState, SourceName, SymbolName};
use crate::storage::local_file::{LinkFile, StorageFile};
use crate::storage::{
    normalize_user_name, resolve_user_name, PackageNameSet, PackageRelatedStorageItem,
    PackageStorageItem, StorageFeed, StorageItem, StorageService,
};

const DEFAULT_FEED_DIRECTORY: &str = "_";
const PACKAGE_PATH_DEPTH: usize = 6;
const LINK_PATH_DEPTH: usize = 4;
const CONTENT_PATH_DEPTH: usize = 3;
const REFERENCE_PATH_DEPTH: usize = 2;
const REFERENCES_DIRECTORY: &str = ".packages";

fn first_letter(name: &str) -> String {
    name.chars()
        .next()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "_".to_string())
}

/// Subdirectories of `path` as (name, path), empty when `path` does not exist.
fn list_directories(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut directories = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            directories.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
        }
    }
    Ok(directories)
}

/// Local filesystem implementation of StorageService
pub struct LocalStorageService {
    root_path: PathBuf,
}

impl LocalStorageService {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        fs::create_dir_all(&root_path)?;
        info!("Using local storage directory: {}", root_path.display());
        Ok(Self { root_path })
    }

    fn feed_path(&self, feed_name: Option<&str>) -> PathBuf {
        self.root_path
            .join(feed_name.unwrap_or(DEFAULT_FEED_DIRECTORY))
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    fn get_feed(&self, feed_name: Option<&str>) -> Arc<dyn StorageFeed> {
        let name = normalize_feed_name(feed_name);
        let path = self.feed_path(name.as_deref());
        Arc::new(LocalStorageFeed {
            inner: Arc::new(LocalFeed { name, path }),
        })
    }

    async fn query_feeds(&self) -> Result<Vec<Option<String>>> {
        let mut feeds: Vec<Option<String>> = list_directories(&self.root_path)?
            .into_iter()
            .map(|(name, _)| (name != DEFAULT_FEED_DIRECTORY).then_some(name))
            .collect();
        feeds.sort();
        Ok(feeds)
    }
}

#[derive(Debug)]
struct LocalFeed {
    name: Option<String>,
    path: PathBuf,
}

impl LocalFeed {
    fn state_path(&self, state: PackageState) -> PathBuf {
        self.path.join(format!(".{}", state.storage_name()))
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

fn user_path(state_path: &Path, user_name: &str) -> PathBuf {
    state_path.join(".users").join(user_name)
}

fn package_relative_path(package_name: &PackageName, extension: &str) -> PathBuf {
    PathBuf::from(first_letter(&package_name.id))
        .join(&package_name.id)
        .join(&package_name.version)
        .join(format!(
            "{}.{}.{}",
            package_name.id, package_name.version, extension
        ))
}

pub struct LocalStorageFeed {
    inner: Arc<LocalFeed>,
}

impl LocalStorageFeed {
    fn query(&self, user_name: Option<&str>, state: PackageState) -> Result<Vec<PackageName>> {
        let mut path = self.inner.state_path(state);
        if let Some(user_name) = user_name {
            path = user_path(&path, user_name);
        }

        let mut names = Vec::new();
        for (letter, letter_path) in list_directories(&path)? {
            if letter.starts_with('.') {
                continue;
            }
            for (id, id_path) in list_directories(&letter_path)? {
                for (version, _) in list_directories(&id_path)? {
                    names.push(PackageName::new(id.clone(), version));
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl StorageFeed for LocalStorageFeed {
    fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    async fn query_internals(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.inner.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn query_packages(
        &self,
        user_name: Option<&str>,
        state: PackageState,
    ) -> Result<Vec<PackageName>> {
        let user_name = normalize_user_name(user_name);
        self.query(user_name.as_deref(), state)
    }

    async fn query_packages_page(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        prefix: Option<&str>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<PackageName>> {
        let prefix = prefix.unwrap_or("");
        Ok(self
            .query_packages(user_name, state)
            .await?
            .into_iter()
            .filter(|name| name.id.starts_with(prefix))
            .skip(skip)
            .take(take)
            .collect())
    }

    fn get_package(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        package_name: &PackageName,
    ) -> Box<dyn PackageStorageItem> {
        Box::new(LocalPackageStorageItem::new(
            self.inner.clone(),
            normalize_user_name(user_name),
            state,
            package_name.clone(),
        ))
    }

    fn get_symbol(
        &self,
        package_name: Option<&PackageName>,
        symbol_name: &SymbolName,
    ) -> Box<dyn PackageRelatedStorageItem> {
        let root_path = self
            .inner
            .path
            .join(first_letter(&symbol_name.image_name))
            .join(format!("{}.pdb", symbol_name.image_name))
            .join(&symbol_name.symbol_hash);
        let item_path = root_path.join(format!("{}.pd_", symbol_name.image_name));

        Box::new(LocalPackageRelatedStorageItem {
            feed: self.inner.clone(),
            package_name: package_name.cloned(),
            label: format!("pdb/{}", symbol_name),
            item_file: StorageFile::new(item_path, CONTENT_PATH_DEPTH),
            root_path,
        })
    }

    fn get_source(
        &self,
        package_name: Option<&PackageName>,
        source_name: &SourceName,
    ) -> Box<dyn PackageRelatedStorageItem> {
        let root_path = self
            .inner
            .path
            .join(first_letter(&source_name.file_name))
            .join(&source_name.file_name)
            .join(&source_name.hash);
        let item_path = root_path.join(&source_name.file_name);

        Box::new(LocalPackageRelatedStorageItem {
            feed: self.inner.clone(),
            package_name: package_name.cloned(),
            label: format!("src/{}", source_name),
            item_file: StorageFile::new(item_path, CONTENT_PATH_DEPTH),
            root_path,
        })
    }

    async fn delete(&self) -> Result<bool> {
        if !self.inner.path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&self.inner.path)?;
        info!("Deleted feed directory {}", self.inner.path.display());
        Ok(true)
    }
}

pub struct LocalPackageStorageItem {
    feed: Arc<LocalFeed>,
    user_name: Option<String>,
    state: PackageState,
    package_name: PackageName,
    state_path: PathBuf,
    link_file: LinkFile,
}

impl LocalPackageStorageItem {
    fn new(
        feed: Arc<LocalFeed>,
        user_name: Option<String>,
        state: PackageState,
        package_name: PackageName,
    ) -> Self {
        let state_path = feed.state_path(state);
        let link_file = LinkFile::new(
            state_path.join(package_relative_path(&package_name, "txt")),
            LINK_PATH_DEPTH,
        );
        Self {
            feed,
            user_name,
            state,
            package_name,
            state_path,
            link_file,
        }
    }

    fn package_file(&self, user_name: &str) -> StorageFile {
        StorageFile::new(
            user_path(&self.state_path, user_name)
                .join(package_relative_path(&self.package_name, "nupkg")),
            PACKAGE_PATH_DEPTH,
        )
    }

    async fn resolved_file(&self) -> Result<Option<StorageFile>> {
        Ok(self
            .user_name()
            .await?
            .map(|user_name| self.package_file(&user_name)))
    }

    /// Deletes payload and marker as whoever the recorded owner is.
    fn delete_as(&self, owner: &str) -> Result<bool> {
        let package_existed = self.package_file(owner).delete()?;
        let link_existed = self.link_file.delete()?;

        if package_existed != link_existed {
            warn!(
                "Package {} had payload = {} but owner record = {}",
                self, package_existed, link_existed
            );
        }
        debug_assert_eq!(package_existed, link_existed);

        Ok(package_existed || link_existed)
    }

    async fn transfer(
        &self,
        new_state: PackageState,
        new_name: &PackageName,
        remove_source: bool,
    ) -> Result<Option<Box<dyn PackageStorageItem>>> {
        if !self.exists().await? {
            return Ok(None);
        }

        let owner = self
            .user_name()
            .await?
            .ok_or_else(|| Error::MissingPackage(self.to_string()))?;
        let new_item = LocalPackageStorageItem::new(
            self.feed.clone(),
            Some(owner.clone()),
            new_state,
            new_name.clone(),
        );

        if new_state == self.state && *new_name == self.package_name {
            return Ok(Some(Box::new(new_item)));
        }

        if let Some(previous) = new_item.link_file.retrieve()? {
            if previous != owner {
                info!("Replacing package {} owned by {}", new_item, previous);
                new_item.package_file(&previous).delete()?;
            }
        }

        let source_file = self.package_file(&owner);
        let destination_file = new_item.package_file(&owner);
        if remove_source {
            source_file.move_to(&destination_file)?;
        } else {
            source_file.copy_to(&destination_file)?;
        }
        new_item.link_file.store(&owner)?;

        if remove_source {
            // the payload was renamed away, only the marker is left behind
            self.link_file.delete()?;
        }

        Ok(Some(Box::new(new_item)))
    }
}

impl fmt::Display for LocalPackageStorageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.feed.display_name(),
            self.state,
            self.package_name
        )
    }
}

#[async_trait]
impl StorageItem for LocalPackageStorageItem {
    fn feed_name(&self) -> Option<&str> {
        self.feed.name.as_deref()
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self
            .resolved_file()
            .await?
            .map(|file| file.exists())
            .unwrap_or(false))
    }

    async fn get(&self) -> Result<Option<Bytes>> {
        match self.resolved_file().await? {
            Some(file) => file.read(),
            None => Ok(None),
        }
    }

    async fn put(&self, content: Bytes) -> Result<()> {
        let user_name = self.user_name.as_deref().ok_or_else(|| {
            Error::invalid_operation(format!("no owner asserted to put package {}", self))
        })?;

        if let Some(previous) = self.link_file.retrieve()? {
            if previous != user_name {
                info!("Package {} changes owner from {} to {}", self, previous, user_name);
                self.package_file(&previous).delete()?;
            }
        }

        self.link_file.store(user_name)?;
        self.package_file(user_name).write(&content)
    }

    async fn delete(&self) -> Result<bool> {
        if self.user_name.is_none() {
            return Err(Error::invalid_operation(format!(
                "no owner asserted to delete package {}",
                self
            )));
        }

        match self.user_name().await? {
            Some(owner) => self.delete_as(&owner),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PackageStorageItem for LocalPackageStorageItem {
    fn name(&self) -> &PackageName {
        &self.package_name
    }

    fn state(&self) -> PackageState {
        self.state
    }

    async fn user_name(&self) -> Result<Option<String>> {
        Ok(resolve_user_name(
            self.link_file.retrieve()?,
            self.user_name.as_deref(),
        ))
    }

    async fn move_to(
        &self,
        new_state: PackageState,
        new_name: &PackageName,
    ) -> Result<Option<Box<dyn PackageStorageItem>>> {
        self.transfer(new_state, new_name, true).await
    }

    async fn copy_to(
        &self,
        new_state: PackageState,
        new_name: &PackageName,
    ) -> Result<Option<Box<dyn PackageStorageItem>>> {
        self.transfer(new_state, new_name, false).await
    }
}

/// Reference set kept as one empty file per package.
pub struct LocalPackageNameSet {
    packages_path: PathBuf,
}

impl LocalPackageNameSet {
    fn file(&self, package_name: &PackageName) -> StorageFile {
        StorageFile::new(
            self.packages_path
                .join(&package_name.id)
                .join(format!("{}.txt", package_name.version)),
            REFERENCE_PATH_DEPTH,
        )
    }
}

#[async_trait]
impl PackageNameSet for LocalPackageNameSet {
    async fn add(&self, package_name: &PackageName) -> Result<()> {
        self.file(package_name).write(&[])
    }

    async fn remove(&self, package_name: &PackageName) -> Result<()> {
        self.file(package_name).delete()?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PackageName>> {
        let mut names = Vec::new();
        for (id, id_path) in list_directories(&self.packages_path)? {
            for entry in fs::read_dir(&id_path)? {
                let path = entry?.path();
                if let Some(version) = path.file_stem() {
                    names.push(PackageName::new(
                        id.clone(),
                        version.to_string_lossy().to_string(),
                    ));
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

pub struct LocalPackageRelatedStorageItem {
    feed: Arc<LocalFeed>,
    package_name: Option<PackageName>,
    label: String,
    root_path: PathBuf,
    item_file: StorageFile,
}

impl LocalPackageRelatedStorageItem {
    fn asserted_package(&self, operation: &str) -> Result<&PackageName> {
        self.package_name.as_ref().ok_or_else(|| {
            Error::invalid_operation(format!("no package name to {} {}", operation, self))
        })
    }
}

impl fmt::Display for LocalPackageRelatedStorageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed.display_name(), self.label)
    }
}

#[async_trait]
impl StorageItem for LocalPackageRelatedStorageItem {
    fn feed_name(&self) -> Option<&str> {
        self.feed.name.as_deref()
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.item_file.exists())
    }

    async fn get(&self) -> Result<Option<Bytes>> {
        self.item_file.read()
    }

    async fn put(&self, content: Bytes) -> Result<()> {
        let package_name = self.asserted_package("put")?;
        let package_names = self.package_names();
        let was_empty = package_names.list().await?.is_empty();

        package_names.add(package_name).await?;

        if was_empty || !self.item_file.exists() {
            self.item_file.write(&content)
        } else {
            debug!("Content {} already stored, referenced by {}", self, package_name);
            Ok(())
        }
    }

    async fn delete(&self) -> Result<bool> {
        let package_name = self.asserted_package("delete")?;
        let package_names = self.package_names();

        package_names.remove(package_name).await?;

        if package_names.list().await?.is_empty() {
            return self.item_file.delete();
        }

        Ok(false)
    }
}

impl PackageRelatedStorageItem for LocalPackageRelatedStorageItem {
    fn package_names(&self) -> Box<dyn PackageNameSet> {
        Box::new(LocalPackageNameSet {
            packages_path: self.root_path.join(REFERENCES_DIRECTORY),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_package_layout_on_disk() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorageService::new(root.path()).unwrap();
        let feed = storage.get_feed(None);
        let name = PackageName::new("Lib", "1.0");

        feed.get_package(Some("alice"), PackageState::New, &name)
            .put(Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let feed_path = root.path().join("_");
        assert!(feed_path
            .join(".new/.users/alice/L/Lib/1.0/Lib.1.0.nupkg")
            .is_file());
        assert!(feed_path.join(".new/L/Lib/1.0/Lib.1.0.txt").is_file());

        let package = feed.get_package(Some("alice"), PackageState::New, &name);
        assert!(package.delete().await.unwrap());
        assert!(!feed_path.join(".new").exists());
        assert!(feed_path.exists());
    }

    #[tokio::test]
    async fn test_content_pruning_keeps_feed_root() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorageService::new(root.path()).unwrap();
        let feed = storage.get_feed(Some("Named"));
        let package_name = PackageName::new("pkg", "1.0");
        let source = feed.get_source(Some(&package_name), &SourceName::new("a.cs", "h1"));

        source.put(Bytes::from_static(b"class A {}")).await.unwrap();
        assert!(root.path().join("named/a/a.cs/h1/a.cs").is_file());
        assert!(root
            .path()
            .join("named/a/a.cs/h1/.packages/pkg/1.0.txt")
            .is_file());

        assert!(source.delete().await.unwrap());
        assert!(!root.path().join("named/a").exists());
        assert!(root.path().join("named").exists());
        assert_eq!(
            storage.query_feeds().await.unwrap(),
            vec![Some("named".to_string())]
        );
    }

    #[tokio::test]
    async fn test_query_skips_user_directories() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorageService::new(root.path()).unwrap();
        let feed = storage.get_feed(None);

        for (id, user) in [("b", "u1"), ("a", "u2")] {
            feed.get_package(Some(user), PackageState::Partial, &PackageName::new(id, "1.0"))
                .put(Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let all = feed.query_packages(None, PackageState::Partial).await.unwrap();
        assert_eq!(
            all,
            vec![PackageName::new("a", "1.0"), PackageName::new("b", "1.0")]
        );
        let mine = feed
            .query_packages(Some("u1"), PackageState::Partial)
            .await
            .unwrap();
        assert_eq!(mine, vec![PackageName::new("b", "1.0")]);
    }
    #[tokio::test]
    async fn test_move_leaves_nothing_at_source() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorageService::new(root.path()).unwrap();
        let feed = storage.get_feed(None);
        let name = PackageName::new("Lib", "1.0");

        feed.get_package(Some("alice"), PackageState::New, &name)
            .put(Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let moved = feed
            .get_package(None, PackageState::New, &name)
            .move_to(PackageState::IndexingQueued, &name)
            .await
            .unwrap()
            .unwrap();

        let feed_path = root.path().join("_");
        assert!(!feed_path
            .join(".new/.users/alice/L/Lib/1.0/Lib.1.0.nupkg")
            .exists());
        assert!(!feed_path.join(".new/L/Lib/1.0/Lib.1.0.txt").exists());
        assert!(!feed_path.join(".new").exists());
        assert!(feed_path
            .join(".indexingqueued/.users/alice/L/Lib/1.0/Lib.1.0.nupkg")
            .is_file());
        assert!(feed_path
            .join(".indexingqueued/L/Lib/1.0/Lib.1.0.txt")
            .is_file());

        let source = feed.get_package(Some("alice"), PackageState::New, &name);
        assert!(!source.exists().await.unwrap());
        assert!(!source.delete().await.unwrap());
        assert_eq!(moved.get().await.unwrap().unwrap(), Bytes::from_static(b"payload"));
    }
}
