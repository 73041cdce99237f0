//! Configuration for storage backends

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::storage::local_store::LocalStorageService;
use crate::storage::remote::object_store::{DirectoryObjectStore, MemoryObjectStore, ObjectStore};
use crate::storage::remote::table_store::{MemoryTableStore, SqliteTableStore, TableStore};
use crate::storage::remote::{RemoteOptions, RemoteStorageService};
use crate::storage::StorageService;
use crate::support::SupportService;

/// Available storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Remote,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "filesystem" | "fs" => Ok(StorageBackend::Local),
            "remote" | "cloud" => Ok(StorageBackend::Remote),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Blob side of the remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    Memory,
    #[default]
    Directory,
}

impl std::str::FromStr for ObjectStoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mock" => Ok(ObjectStoreBackend::Memory),
            "directory" | "dir" => Ok(ObjectStoreBackend::Directory),
            _ => Err(format!("Unknown object store backend: {}", s)),
        }
    }
}

/// Metadata side of the remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for TableBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(TableBackend::Sqlite),
            "memory" | "mock" => Ok(TableBackend::Memory),
            _ => Err(format!("Unknown table backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStorageConfig {
    pub object_store: ObjectStoreBackend,
    pub object_store_path: String,
    pub table: TableBackend,
    pub table_db_path: String,
    pub copy_poll_interval_ms: u64,
    pub copy_timeout_secs: u64,
    pub query_cache_timeout_secs: u64,
}

impl Default for RemoteStorageConfig {
    fn default() -> Self {
        Self {
            object_store: ObjectStoreBackend::default(),
            object_store_path: "./data/objects".to_string(),
            table: TableBackend::default(),
            table_db_path: "./data/tables/tables.sqlite".to_string(),
            copy_poll_interval_ms: 1000,
            copy_timeout_secs: 120,
            query_cache_timeout_secs: 300,
        }
    }
}

impl RemoteStorageConfig {
    pub fn options(&self) -> RemoteOptions {
        RemoteOptions {
            copy_poll_interval: Duration::from_millis(self.copy_poll_interval_ms),
            copy_timeout: Duration::from_secs(self.copy_timeout_secs),
            query_cache_timeout: Duration::from_secs(self.query_cache_timeout_secs),
        }
    }
}

/// Configuration for package, symbol and source storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root_path: String,
    pub remote: RemoteStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root_path: "./data/storage".to_string(),
            remote: RemoteStorageConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Default configuration with `STORAGE_BACKEND` applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overrides the backend from `STORAGE_BACKEND` when it is set and valid
    pub fn apply_env(&mut self) {
        match env::var("STORAGE_BACKEND") {
            Ok(backend_str) => match backend_str.parse::<StorageBackend>() {
                Ok(backend) => {
                    info!("Using storage backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!(
                        "Invalid storage backend in environment: {}. Keeping {:?}.",
                        e, self.backend
                    );
                }
            },
            Err(_) => {
                info!("No storage backend specified in environment, using {:?}", self.backend);
            }
        }
    }

    /// Create a storage service based on the configuration
    pub fn create_storage(
        &self,
        support: Option<Arc<dyn SupportService>>,
    ) -> Result<Arc<dyn StorageService>> {
        match self.backend {
            StorageBackend::Local => Ok(Arc::new(LocalStorageService::new(&self.root_path)?)),
            StorageBackend::Remote => {
                let remote = &self.remote;
                let objects: Arc<dyn ObjectStore> = match remote.object_store {
                    ObjectStoreBackend::Memory => Arc::new(MemoryObjectStore::new()),
                    ObjectStoreBackend::Directory => {
                        Arc::new(DirectoryObjectStore::new(&remote.object_store_path)?)
                    }
                };
                let tables: Arc<dyn TableStore> = match remote.table {
                    TableBackend::Sqlite => {
                        Arc::new(SqliteTableStore::open(&PathBuf::from(&remote.table_db_path))?)
                    }
                    TableBackend::Memory => Arc::new(MemoryTableStore::new()),
                };
                info!(
                    "Using remote storage with {:?} objects and {:?} tables",
                    remote.object_store, remote.table
                );
                Ok(Arc::new(RemoteStorageService::new(
                    objects,
                    tables,
                    remote.options(),
                    support,
                )))
            }
        }
    }
}
