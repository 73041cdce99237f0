//! Indexed metadata rows for the remote backend
//!
//! Entities are addressed by (table, partition key, row key) and carry an optional
//! string value. Row existence alone is meaningful for reference sets.

use async_trait::async_trait;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::storage::remote::object_store::Segment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub value: Option<String>,
}

impl TableEntity {
    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            value,
        }
    }
}

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool>;

    async fn delete_table(&self, table: &str) -> Result<bool>;

    /// `None` for a missing row or a missing table
    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>>;

    /// Fails with `Error::ContainerNotFound` when the table does not exist
    async fn insert_or_replace(&self, table: &str, entity: TableEntity) -> Result<()>;

    async fn delete(&self, table: &str, partition_key: &str, row_key: &str) -> Result<bool>;

    /// Rows of one partition whose row key starts with `row_prefix`, ordered by row key.
    /// Fails with `Error::ContainerNotFound` when the table does not exist.
    async fn query_segmented(
        &self,
        table: &str,
        partition_key: &str,
        row_prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<TableEntity>>;
}

/// SQLite-backed table store
pub struct SqliteTableStore {
    connection: Mutex<Connection>,
}

impl SqliteTableStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Using table database: {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS tables (
                name TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS entities (
                table_name TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                row_key TEXT NOT NULL,
                value TEXT,
                PRIMARY KEY (table_name, partition_key, row_key)
            );",
        )?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn table_exists(connection: &Connection, table: &str) -> Result<bool> {
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM tables WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[async_trait]
impl TableStore for SqliteTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        let connection = self.connection();
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO tables (name) VALUES (?1)",
            params![table],
        )?;
        Ok(inserted > 0)
    }

    async fn delete_table(&self, table: &str) -> Result<bool> {
        let connection = self.connection();
        connection.execute(
            "DELETE FROM entities WHERE table_name = ?1",
            params![table],
        )?;
        let deleted = connection.execute("DELETE FROM tables WHERE name = ?1", params![table])?;
        Ok(deleted > 0)
    }

    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>> {
        let connection = self.connection();
        let value = connection
            .query_row(
                "SELECT value FROM entities
                 WHERE table_name = ?1 AND partition_key = ?2 AND row_key = ?3",
                params![table, partition_key, row_key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.map(|value| TableEntity::new(partition_key, row_key, value)))
    }

    async fn insert_or_replace(&self, table: &str, entity: TableEntity) -> Result<()> {
        let connection = self.connection();
        if !Self::table_exists(&connection, table)? {
            return Err(Error::ContainerNotFound(table.to_string()));
        }
        connection.execute(
            "INSERT OR REPLACE INTO entities (table_name, partition_key, row_key, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![table, entity.partition_key, entity.row_key, entity.value],
        )?;
        Ok(())
    }

    async fn delete(&self, table: &str, partition_key: &str, row_key: &str) -> Result<bool> {
        let connection = self.connection();
        let deleted = connection.execute(
            "DELETE FROM entities
             WHERE table_name = ?1 AND partition_key = ?2 AND row_key = ?3",
            params![table, partition_key, row_key],
        )?;
        Ok(deleted > 0)
    }

    async fn query_segmented(
        &self,
        table: &str,
        partition_key: &str,
        row_prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<TableEntity>> {
        let connection = self.connection();
        if !Self::table_exists(&connection, table)? {
            return Err(Error::ContainerNotFound(table.to_string()));
        }

        let mut statement = connection.prepare(
            "SELECT row_key, value FROM entities
             WHERE table_name = ?1 AND partition_key = ?2
               AND substr(row_key, 1, length(?3)) = ?3
               AND row_key > ?4
             ORDER BY row_key
             LIMIT ?5",
        )?;
        let rows = statement.query_map(
            params![
                table,
                partition_key,
                row_prefix,
                continuation.unwrap_or(""),
                (page_size + 1) as i64
            ],
            |row| {
                Ok(TableEntity::new(
                    partition_key,
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            },
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        let continuation = if items.len() > page_size {
            items.truncate(page_size);
            items.last().map(|entity| entity.row_key.clone())
        } else {
            None
        };

        Ok(Segment {
            items,
            continuation,
        })
    }
}

type Partitions = BTreeMap<String, BTreeMap<String, Option<String>>>;

/// In-memory table store
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<BTreeMap<String, Partitions>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, Partitions>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        let mut tables = self.tables();
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_string(), Partitions::new());
        Ok(true)
    }

    async fn delete_table(&self, table: &str) -> Result<bool> {
        Ok(self.tables().remove(table).is_some())
    }

    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>> {
        Ok(self
            .tables()
            .get(table)
            .and_then(|partitions| partitions.get(partition_key))
            .and_then(|rows| rows.get(row_key))
            .map(|value| TableEntity::new(partition_key, row_key, value.clone())))
    }

    async fn insert_or_replace(&self, table: &str, entity: TableEntity) -> Result<()> {
        let mut tables = self.tables();
        let partitions = tables
            .get_mut(table)
            .ok_or_else(|| Error::ContainerNotFound(table.to_string()))?;
        partitions
            .entry(entity.partition_key)
            .or_default()
            .insert(entity.row_key, entity.value);
        Ok(())
    }

    async fn delete(&self, table: &str, partition_key: &str, row_key: &str) -> Result<bool> {
        let mut tables = self.tables();
        let Some(rows) = tables
            .get_mut(table)
            .and_then(|partitions| partitions.get_mut(partition_key))
        else {
            return Ok(false);
        };
        Ok(rows.remove(row_key).is_some())
    }

    async fn query_segmented(
        &self,
        table: &str,
        partition_key: &str,
        row_prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Segment<TableEntity>> {
        let tables = self.tables();
        let partitions = tables
            .get(table)
            .ok_or_else(|| Error::ContainerNotFound(table.to_string()))?;
        let Some(rows) = partitions.get(partition_key) else {
            return Ok(Segment::empty());
        };

        let mut items: Vec<TableEntity> = rows
            .iter()
            .filter(|(row_key, _)| row_key.starts_with(row_prefix))
            .filter(|(row_key, _)| continuation.map_or(true, |token| row_key.as_str() > token))
            .take(page_size + 1)
            .map(|(row_key, value)| TableEntity::new(partition_key, row_key.clone(), value.clone()))
            .collect();

        let continuation = if items.len() > page_size {
            items.truncate(page_size);
            items.last().map(|entity| entity.row_key.clone())
        } else {
            None
        };

        Ok(Segment {
            items,
            continuation,
        })
    }
}
