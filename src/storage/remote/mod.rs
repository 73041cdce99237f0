//! Remote storage backend: blobs in an object store, owners and references in a table store
//!
//! One container and one table per feed:
//!
//! ```text
//! pkg/<state>/<user>/<id>/<version>/<id>.<version>.nupkg   row pkg*<state> / <id>*<version> = user
//! pdb/<image>/<hash>                                       rows pdb*<image>*<hash> / <id>*<version>
//! src/<file>/<hash>                                        rows src*<file>*<hash> / <id>*<version>
//! ```

pub mod object_store;
pub mod query_cache;
pub mod table_store;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::model::{normalize_feed_name, PackageName, PackageState, SourceName, SymbolName};
use crate::storage::{
    normalize_user_name, resolve_user_name, PackageNameSet, PackageRelatedStorageItem,
    PackageStorageItem, StorageFeed, StorageItem, StorageService,
};
use crate::support::SupportService;

use object_store::{CopyState, ObjectStore, Segment};
use query_cache::{QueryCache, DEFAULT_QUERY_CACHE_TIMEOUT};
use table_store::{TableEntity, TableStore};

const CONTAINER_PREFIX: &str = "feed-";
const DEFAULT_CONTAINER: &str = "feed-default";
const NAMED_CONTAINER_PREFIX: &str = "feed-named-";
const PAGE_SIZE: usize = 100;

/// Timings of the remote backend
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub copy_poll_interval: Duration,
    pub copy_timeout: Duration,
    pub query_cache_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            copy_poll_interval: Duration::from_secs(1),
            copy_timeout: Duration::from_secs(2 * 60),
            query_cache_timeout: DEFAULT_QUERY_CACHE_TIMEOUT,
        }
    }
}

pub struct RemoteStorageService {
    objects: Arc<dyn ObjectStore>,
    tables: Arc<dyn TableStore>,
    options: RemoteOptions,
    cache: Arc<QueryCache>,
}

impl RemoteStorageService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        tables: Arc<dyn TableStore>,
        options: RemoteOptions,
        support: Option<Arc<dyn SupportService>>,
    ) -> Self {
        let cache = QueryCache::new(options.query_cache_timeout, support);
        Self {
            objects,
            tables,
            options,
            cache,
        }
    }
}

fn container_name(feed_name: Option<&str>) -> String {
    match feed_name {
        Some(name) => format!("{}{}", NAMED_CONTAINER_PREFIX, name),
        None => DEFAULT_CONTAINER.to_string(),
    }
}

fn table_name(container: &str) -> String {
    container
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn row_key(package_name: &PackageName) -> String {
    format!("{}*{}", package_name.id, package_name.version)
}

fn parse_row_key(row_key: &str) -> Option<PackageName> {
    let (id, version) = row_key.split_once('*')?;
    if id.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackageName::new(id, version))
}

/// Turns a missing container or table into an empty listing.
fn empty_if_missing<T>(result: Result<Segment<T>>) -> Result<Segment<T>> {
    match result {
        Err(Error::ContainerNotFound(name)) => {
            debug!("Listing missing container {} as empty", name);
            Ok(Segment::empty())
        }
        other => other,
    }
}

#[async_trait]
impl StorageService for RemoteStorageService {
    fn get_feed(&self, feed_name: Option<&str>) -> Arc<dyn StorageFeed> {
        let name = normalize_feed_name(feed_name);
        let container = container_name(name.as_deref());
        let table = table_name(&container);

        Arc::new(RemoteStorageFeed {
            inner: Arc::new(RemoteFeed {
                name,
                container,
                table,
                objects: self.objects.clone(),
                tables: self.tables.clone(),
                options: self.options.clone(),
                cache: self.cache.clone(),
            }),
        })
    }

    async fn query_feeds(&self) -> Result<Vec<Option<String>>> {
        Ok(self
            .objects
            .list_containers(CONTAINER_PREFIX)
            .await?
            .into_iter()
            .filter_map(|container| {
                if container == DEFAULT_CONTAINER {
                    Some(None)
                } else {
                    container
                        .strip_prefix(NAMED_CONTAINER_PREFIX)
                        .map(|name| Some(name.to_string()))
                }
            })
            .collect())
    }
}

struct RemoteFeed {
    name: Option<String>,
    container: String,
    table: String,
    objects: Arc<dyn ObjectStore>,
    tables: Arc<dyn TableStore>,
    options: RemoteOptions,
    cache: Arc<QueryCache>,
}

impl RemoteFeed {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    async fn ensure_container(&self) -> Result<()> {
        if self
            .objects
            .create_container_if_not_exists(&self.container)
            .await?
        {
            info!("Created container {}", self.container);
        }
        Ok(())
    }

    async fn ensure_table(&self) -> Result<()> {
        if self.tables.create_table_if_not_exists(&self.table).await? {
            info!("Created table {}", self.table);
        }
        Ok(())
    }

    /// Copies a blob inside the feed container and waits for the copy to settle.
    async fn copy_blob(&self, source: &str, destination: &str) -> Result<()> {
        self.objects
            .start_copy(&self.container, source, destination)
            .await?;

        let path = format!("{}/{}", self.container, destination);
        let deadline = Instant::now() + self.options.copy_timeout;

        loop {
            match self.objects.copy_status(&self.container, destination).await? {
                Some(status) if status.state == CopyState::Success => return Ok(()),
                Some(status) if status.state == CopyState::Pending => {}
                Some(status) => {
                    return Err(Error::CopyFailed {
                        path,
                        status: status.to_string(),
                    })
                }
                None => {
                    return Err(Error::CopyFailed {
                        path,
                        status: "destination missing".to_string(),
                    })
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::CopyTimeout(path));
            }
            tokio::time::sleep(self.options.copy_poll_interval).await;
        }
    }

    async fn fetch_page(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<Segment<PackageName>> {
        match user_name {
            Some(user_name) => {
                let blob_prefix = format!("pkg/{}/{}/{}", state.storage_name(), user_name, prefix);
                let segment = empty_if_missing(
                    self.objects
                        .list_segmented(
                            &self.container,
                            &blob_prefix,
                            continuation.as_deref(),
                            PAGE_SIZE,
                        )
                        .await,
                )?;

                let items = segment
                    .items
                    .iter()
                    .filter_map(|blob| {
                        let parts: Vec<&str> = blob.split('/').collect();
                        (parts.len() >= 5).then(|| PackageName::new(parts[3], parts[4]))
                    })
                    .collect();

                Ok(Segment {
                    items,
                    continuation: segment.continuation,
                })
            }
            None => {
                let partition = format!("pkg*{}", state.storage_name());
                let segment = empty_if_missing(
                    self.tables
                        .query_segmented(
                            &self.table,
                            &partition,
                            prefix,
                            continuation.as_deref(),
                            PAGE_SIZE,
                        )
                        .await,
                )?;

                Ok(Segment {
                    items: segment
                        .items
                        .iter()
                        .filter_map(|entity| parse_row_key(&entity.row_key))
                        .collect(),
                    continuation: segment.continuation,
                })
            }
        }
    }
}

pub struct RemoteStorageFeed {
    inner: Arc<RemoteFeed>,
}

#[async_trait]
impl StorageFeed for RemoteStorageFeed {
    fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    async fn query_internals(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let segment = empty_if_missing(
                self.inner
                    .objects
                    .list_segmented(&self.inner.container, "", continuation.as_deref(), PAGE_SIZE)
                    .await,
            )?;
            names.extend(segment.items);

            match segment.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(names)
    }

    async fn query_packages(
        &self,
        user_name: Option<&str>,
        state: PackageState,
    ) -> Result<Vec<PackageName>> {
        let mut names = Vec::new();
        loop {
            let page = self
                .query_packages_page(user_name, state, None, names.len(), PAGE_SIZE)
                .await?;
            let done = page.len() < PAGE_SIZE;
            names.extend(page);
            if done {
                break;
            }
        }
        Ok(names)
    }

    async fn query_packages_page(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        prefix: Option<&str>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<PackageName>> {
        let user_name = normalize_user_name(user_name);
        let prefix = prefix.unwrap_or("");
        let feed = self.inner.display_name();

        let key = match &user_name {
            Some(user_name) => format!("{}/{}/{}/{}/*", feed, state, user_name, prefix),
            None => format!("{}/{}/{}*", feed, state, prefix),
        };

        let inner = &self.inner;
        let user_name = user_name.as_deref();
        self.inner
            .cache
            .query(key, skip, take, |continuation| {
                inner.fetch_page(user_name, state, prefix, continuation)
            })
            .await
    }

    fn get_package(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        package_name: &PackageName,
    ) -> Box<dyn PackageStorageItem> {
        Box::new(RemotePackageStorageItem {
            feed: self.inner.clone(),
            user_name: normalize_user_name(user_name),
            state,
            package_name: package_name.clone(),
        })
    }

    fn get_symbol(
        &self,
        package_name: Option<&PackageName>,
        symbol_name: &SymbolName,
    ) -> Box<dyn PackageRelatedStorageItem> {
        Box::new(RemotePackageRelatedStorageItem {
            feed: self.inner.clone(),
            package_name: package_name.cloned(),
            blob: format!("pdb/{}/{}", symbol_name.image_name, symbol_name.symbol_hash),
            partition: format!("pdb*{}*{}", symbol_name.image_name, symbol_name.symbol_hash),
        })
    }

    fn get_source(
        &self,
        package_name: Option<&PackageName>,
        source_name: &SourceName,
    ) -> Box<dyn PackageRelatedStorageItem> {
        Box::new(RemotePackageRelatedStorageItem {
            feed: self.inner.clone(),
            package_name: package_name.cloned(),
            blob: format!("src/{}/{}", source_name.file_name, source_name.hash),
            partition: format!("src*{}*{}", source_name.file_name, source_name.hash),
        })
    }

    async fn delete(&self) -> Result<bool> {
        let table_deleted = self.inner.tables.delete_table(&self.inner.table).await?;
        let container_deleted = self
            .inner
            .objects
            .delete_container(&self.inner.container)
            .await?;
        info!(
            "Deleted feed {} (table = {}, container = {})",
            self.inner.container, table_deleted, container_deleted
        );
        Ok(table_deleted || container_deleted)
    }
}

pub struct RemotePackageStorageItem {
    feed: Arc<RemoteFeed>,
    user_name: Option<String>,
    state: PackageState,
    package_name: PackageName,
}

impl RemotePackageStorageItem {
    fn partition(&self) -> String {
        format!("pkg*{}", self.state.storage_name())
    }

    fn blob_name(&self, user_name: &str) -> String {
        format!(
            "pkg/{}/{}/{}/{}/{}.{}.nupkg",
            self.state.storage_name(),
            user_name,
            self.package_name.id,
            self.package_name.version,
            self.package_name.id,
            self.package_name.version
        )
    }

    async fn recorded_owner(&self) -> Result<Option<String>> {
        Ok(self
            .feed
            .tables
            .retrieve(&self.feed.table, &self.partition(), &row_key(&self.package_name))
            .await?
            .and_then(|entity| entity.value))
    }

    async fn record_owner(&self, owner: &str) -> Result<()> {
        self.feed.ensure_table().await?;
        self.feed
            .tables
            .insert_or_replace(
                &self.feed.table,
                TableEntity::new(
                    self.partition(),
                    row_key(&self.package_name),
                    Some(owner.to_string()),
                ),
            )
            .await
    }

    /// Drops the payload of a previous owner different from `owner`.
    async fn displace_previous_owner(&self, owner: &str) -> Result<()> {
        if let Some(previous) = self.recorded_owner().await? {
            if previous != owner {
                info!("Package {} changes owner from {} to {}", self, previous, owner);
                self.feed
                    .objects
                    .delete(&self.feed.container, &self.blob_name(&previous))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_as(&self, owner: &str) -> Result<bool> {
        let blob_existed = self
            .feed
            .objects
            .delete(&self.feed.container, &self.blob_name(owner))
            .await?;
        let row_existed = self
            .feed
            .tables
            .delete(&self.feed.table, &self.partition(), &row_key(&self.package_name))
            .await?;

        if blob_existed != row_existed {
            warn!(
                "Package {} had payload = {} but owner record = {}",
                self, blob_existed, row_existed
            );
        }
        debug_assert_eq!(blob_existed, row_existed);

        Ok(blob_existed || row_existed)
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
        let new_item = RemotePackageStorageItem {
            feed: self.feed.clone(),
            user_name: Some(owner.clone()),
            state: new_state,
            package_name: new_name.clone(),
        };

        if new_state == self.state && *new_name == self.package_name {
            return Ok(Some(Box::new(new_item)));
        }

        new_item.displace_previous_owner(&owner).await?;
        new_item.record_owner(&owner).await?;
        self.feed
            .copy_blob(&self.blob_name(&owner), &new_item.blob_name(&owner))
            .await?;

        if remove_source {
            self.delete_as(&owner).await?;
        }

        Ok(Some(Box::new(new_item)))
    }
}

impl fmt::Display for RemotePackageStorageItem {
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
impl StorageItem for RemotePackageStorageItem {
    fn feed_name(&self) -> Option<&str> {
        self.feed.name.as_deref()
    }

    async fn exists(&self) -> Result<bool> {
        match self.user_name().await? {
            Some(owner) => {
                self.feed
                    .objects
                    .exists(&self.feed.container, &self.blob_name(&owner))
                    .await
            }
            None => Ok(false),
        }
    }

    async fn get(&self) -> Result<Option<Bytes>> {
        match self.user_name().await? {
            Some(owner) => {
                self.feed
                    .objects
                    .get(&self.feed.container, &self.blob_name(&owner))
                    .await
            }
            None => Ok(None),
        }
    }

    async fn put(&self, content: Bytes) -> Result<()> {
        let user_name = self.user_name.as_deref().ok_or_else(|| {
            Error::invalid_operation(format!("no owner asserted to put package {}", self))
        })?;

        self.displace_previous_owner(user_name).await?;
        self.feed.ensure_container().await?;
        self.record_owner(user_name).await?;
        self.feed
            .objects
            .put(&self.feed.container, &self.blob_name(user_name), content)
            .await
    }

    async fn delete(&self) -> Result<bool> {
        if self.user_name.is_none() {
            return Err(Error::invalid_operation(format!(
                "no owner asserted to delete package {}",
                self
            )));
        }

        match self.user_name().await? {
            Some(owner) => self.delete_as(&owner).await,
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PackageStorageItem for RemotePackageStorageItem {
    fn name(&self) -> &PackageName {
        &self.package_name
    }

    fn state(&self) -> PackageState {
        self.state
    }

    async fn user_name(&self) -> Result<Option<String>> {
        Ok(resolve_user_name(
            self.recorded_owner().await?,
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

/// Reference set kept as payload-less rows in one partition.
pub struct RemotePackageNameSet {
    feed: Arc<RemoteFeed>,
    partition: String,
}

#[async_trait]
impl PackageNameSet for RemotePackageNameSet {
    async fn add(&self, package_name: &PackageName) -> Result<()> {
        self.feed.ensure_table().await?;
        self.feed
            .tables
            .insert_or_replace(
                &self.feed.table,
                TableEntity::new(self.partition.clone(), row_key(package_name), None),
            )
            .await
    }

    async fn remove(&self, package_name: &PackageName) -> Result<()> {
        self.feed
            .tables
            .delete(&self.feed.table, &self.partition, &row_key(package_name))
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PackageName>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let segment = empty_if_missing(
                self.feed
                    .tables
                    .query_segmented(
                        &self.feed.table,
                        &self.partition,
                        "",
                        continuation.as_deref(),
                        PAGE_SIZE,
                    )
                    .await,
            )?;
            names.extend(
                segment
                    .items
                    .iter()
                    .filter_map(|entity| parse_row_key(&entity.row_key)),
            );

            match segment.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(names)
    }
}

pub struct RemotePackageRelatedStorageItem {
    feed: Arc<RemoteFeed>,
    package_name: Option<PackageName>,
    blob: String,
    partition: String,
}

impl RemotePackageRelatedStorageItem {
    fn asserted_package(&self, operation: &str) -> Result<&PackageName> {
        self.package_name.as_ref().ok_or_else(|| {
            Error::invalid_operation(format!("no package name to {} {}", operation, self))
        })
    }
}

impl fmt::Display for RemotePackageRelatedStorageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed.display_name(), self.blob)
    }
}

#[async_trait]
impl StorageItem for RemotePackageRelatedStorageItem {
    fn feed_name(&self) -> Option<&str> {
        self.feed.name.as_deref()
    }

    async fn exists(&self) -> Result<bool> {
        self.feed.objects.exists(&self.feed.container, &self.blob).await
    }

    async fn get(&self) -> Result<Option<Bytes>> {
        self.feed.objects.get(&self.feed.container, &self.blob).await
    }

    async fn put(&self, content: Bytes) -> Result<()> {
        let package_name = self.asserted_package("put")?;
        let package_names = self.package_names();
        let was_empty = package_names.list().await?.is_empty();

        package_names.add(package_name).await?;

        if was_empty || !self.exists().await? {
            self.feed.ensure_container().await?;
            self.feed
                .objects
                .put(&self.feed.container, &self.blob, content)
                .await
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
            return self.feed.objects.delete(&self.feed.container, &self.blob).await;
        }

        Ok(false)
    }
}

impl PackageRelatedStorageItem for RemotePackageRelatedStorageItem {
    fn package_names(&self) -> Box<dyn PackageNameSet> {
        Box::new(RemotePackageNameSet {
            feed: self.feed.clone(),
            partition: self.partition.clone(),
        })
    }
}
