//! Storage Layer Abstraction
//!
//! Feeds own package slots (one per state and package name, owned by a user) and a
//! content-addressed space of symbols and sources shared between packages through
//! reference sets. Two backends implement the same contracts: a local filesystem
//! backend and a remote object + table backend.

pub mod config;
pub mod local_file;
pub mod local_store;
pub mod remote;

#[cfg(test)]
mod comprehensive_test;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{PackageName, PackageState, SourceName, SymbolName};

/// A single stored blob.
///
/// `get` returns `None` and `delete` returns `false` when the item is absent.
#[async_trait]
pub trait StorageItem: Send + Sync + fmt::Display {
    /// Name of the feed the item belongs to, `None` for the default feed
    fn feed_name(&self) -> Option<&str>;

    async fn exists(&self) -> Result<bool>;

    async fn get(&self) -> Result<Option<Bytes>>;

    /// Create or truncate the item with `content`
    async fn put(&self, content: Bytes) -> Result<()>;

    async fn delete(&self) -> Result<bool>;
}

/// One (state, name) package slot.
///
/// A handle created without a user name reads as the recorded owner but refuses
/// `put` and `delete`. The payload and its owner record exist together or not at all.
#[async_trait]
pub trait PackageStorageItem: StorageItem {
    fn name(&self) -> &PackageName;

    fn state(&self) -> PackageState;

    /// Owner visible through this handle. `None` when nothing is recorded and no
    /// owner was asserted, or when the asserted owner is not the recorded one.
    async fn user_name(&self) -> Result<Option<String>>;

    /// Copy then delete the source. `None` when the source does not exist.
    async fn move_to(
        &self,
        new_state: PackageState,
        new_name: &PackageName,
    ) -> Result<Option<Box<dyn PackageStorageItem>>>;

    /// Duplicate payload and owner record. `None` when the source does not exist.
    async fn copy_to(
        &self,
        new_state: PackageState,
        new_name: &PackageName,
    ) -> Result<Option<Box<dyn PackageStorageItem>>>;
}

/// Reference set of packages pinning a content-addressed item.
#[async_trait]
pub trait PackageNameSet: Send + Sync {
    async fn add(&self, package_name: &PackageName) -> Result<()>;
    async fn remove(&self, package_name: &PackageName) -> Result<()>;
    async fn list(&self) -> Result<Vec<PackageName>>;
}

/// A symbol or source blob shared across packages.
///
/// The blob exists iff its reference set is non-empty. `put` and `delete` need the
/// handle to carry a package name.
pub trait PackageRelatedStorageItem: StorageItem {
    fn package_names(&self) -> Box<dyn PackageNameSet>;
}

#[async_trait]
pub trait StorageFeed: Send + Sync {
    fn name(&self) -> Option<&str>;

    /// Raw backend entries, for diagnostics
    async fn query_internals(&self) -> Result<Vec<String>>;

    /// All packages in `state`, optionally only those owned by `user_name`
    async fn query_packages(
        &self,
        user_name: Option<&str>,
        state: PackageState,
    ) -> Result<Vec<PackageName>>;

    /// One page of packages whose id starts with `prefix`
    async fn query_packages_page(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        prefix: Option<&str>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<PackageName>>;

    fn get_package(
        &self,
        user_name: Option<&str>,
        state: PackageState,
        package_name: &PackageName,
    ) -> Box<dyn PackageStorageItem>;

    fn get_symbol(
        &self,
        package_name: Option<&PackageName>,
        symbol_name: &SymbolName,
    ) -> Box<dyn PackageRelatedStorageItem>;

    fn get_source(
        &self,
        package_name: Option<&PackageName>,
        source_name: &SourceName,
    ) -> Box<dyn PackageRelatedStorageItem>;

    /// Remove the whole feed
    async fn delete(&self) -> Result<bool>;
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// `None` or a blank name selects the default feed. Names are case-normalized.
    fn get_feed(&self, feed_name: Option<&str>) -> Arc<dyn StorageFeed>;

    async fn query_feeds(&self) -> Result<Vec<Option<String>>>;
}

/// Normalizes an optional user name: blank means "no owner asserted".
pub(crate) fn normalize_user_name(user_name: Option<&str>) -> Option<String> {
    user_name
        .filter(|name| !name.trim().is_empty())
        .map(str::to_string)
}

/// Resolves the owner seen through a handle from the recorded owner.
pub(crate) fn resolve_user_name(
    recorded: Option<String>,
    asserted: Option<&str>,
) -> Option<String> {
    match (recorded, asserted) {
        (Some(recorded), None) => Some(recorded),
        (Some(recorded), Some(asserted)) if recorded != asserted => None,
        (_, asserted) => asserted.map(str::to_string),
    }
}
