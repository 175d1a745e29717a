//! The database dispatcher: shared stores plus an in-memory cache of open
//! tables.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use super::descriptor::{ColumnSpec, TableDescriptor};
use super::row::Row;
use super::table::Table;
use crate::btree::Direction;
use crate::error::ChunkDbError;
use crate::key::{IndexKey, Value};
use crate::store::{
    retrieve_expected, ChunkHash, ChunkStore, DirectoryChunkStore, DirectoryPayloadStore,
    PayloadStore, Registry,
};

/// A database: a chunk store, a payload store and a registry shared by
/// every table, with open tables cached under `owner|name`.
pub struct ChunkDb {
    store: Arc<dyn ChunkStore>,
    payloads: Arc<dyn PayloadStore>,
    registry: Arc<Registry>,
    tables: Mutex<HashMap<String, Arc<Table>>>,
}

impl ChunkDb {
    /// Open a database rooted at `path`, with `chunks/`, `payloads/` and
    /// `registry/` subdirectories created as needed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening database");
        let store = Arc::new(DirectoryChunkStore::open(path.join("chunks")).await?);
        let payloads = Arc::new(DirectoryPayloadStore::open(path.join("payloads")).await?);
        let registry = Arc::new(Registry::open(path.join("registry")).await?);
        Ok(ChunkDb::with_stores(store, payloads, registry))
    }

    /// Assemble a database from externally provided stores.
    pub fn with_stores(
        store: Arc<dyn ChunkStore>,
        payloads: Arc<dyn PayloadStore>,
        registry: Arc<Registry>,
    ) -> Self {
        ChunkDb {
            store,
            payloads,
            registry,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// The shared registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn table_key(owner: &str, name: &str) -> String {
        format!("{owner}|{name}")
    }

    /// Create table `name` for `owner`: validate the schema, store the
    /// initial descriptor chunk (every root empty) and publish its hash in
    /// the registry.
    pub async fn create_table(
        &self,
        owner: &str,
        name: &str,
        columns: &[ColumnSpec],
        bid: f64,
        replication: i64,
        encrypted: i64,
    ) -> Result<Arc<Table>> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ChunkDbError::InvalidTableName(name.to_string()).into());
        }
        // Schema problems surface before any chunk is written.
        let descriptor = TableDescriptor::new(columns, bid, replication, encrypted)?;
        let chunk = descriptor.serialize()?;
        let hash = self.store.store(&chunk).await?;
        self.registry.put_root(name, &hash).await?;
        tracing::info!(owner, table = name, root = %hash, "created table");
        let table = Arc::new(Table::from_descriptor(
            owner,
            name,
            descriptor,
            self.store.clone(),
            self.payloads.clone(),
            self.registry.clone(),
        )?);
        let mut tables = self.tables.lock().await;
        tables.insert(Self::table_key(owner, name), table.clone());
        Ok(table)
    }

    /// Resolve `name` through the registry, read its descriptor chunk and
    /// materialize the table with unloaded index roots. Open tables are
    /// cached per `(owner, name)`.
    pub async fn open_table(&self, owner: &str, name: &str) -> Result<Arc<Table>> {
        let key = Self::table_key(owner, name);
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get(&key) {
            return Ok(table.clone());
        }
        let root = self.registry.get_root(name).await?;
        let bytes = retrieve_expected(self.store.as_ref(), &root).await?;
        let descriptor = TableDescriptor::deserialize(&bytes, &root)?;
        tracing::info!(owner, table = name, root = %root, "opened table");
        let table = Arc::new(Table::from_descriptor(
            owner,
            name,
            descriptor,
            self.store.clone(),
            self.payloads.clone(),
            self.registry.clone(),
        )?);
        tables.insert(key, table.clone());
        Ok(table)
    }

    /// Drop a table from the in-memory cache, discarding any unflushed
    /// state. The next open re-reads the registry.
    pub async fn close_table(&self, owner: &str, name: &str) {
        self.tables
            .lock()
            .await
            .remove(&Self::table_key(owner, name));
    }

    /// `Put` through the dispatcher.
    pub async fn put(&self, owner: &str, name: &str, row: &Row) -> Result<()> {
        self.open_table(owner, name).await?.put(row).await
    }

    /// Strict `Insert` through the dispatcher.
    pub async fn insert(&self, owner: &str, name: &str, row: &Row) -> Result<()> {
        self.open_table(owner, name).await?.insert(row).await
    }

    /// `Get` through the dispatcher.
    pub async fn get(&self, owner: &str, name: &str, key: &Value) -> Result<Option<Row>> {
        self.open_table(owner, name).await?.get(key).await
    }

    /// `Delete` through the dispatcher.
    pub async fn delete(&self, owner: &str, name: &str, key: &Value) -> Result<bool> {
        self.open_table(owner, name).await?.delete(key).await
    }

    /// `Scan` through the dispatcher; only valid on ordered columns.
    pub async fn scan<F>(
        &self,
        owner: &str,
        name: &str,
        column: &str,
        direction: Direction,
        visitor: F,
    ) -> Result<()>
    where
        F: FnMut(&IndexKey, &ChunkHash) -> ControlFlow<()> + Send,
    {
        self.open_table(owner, name)
            .await?
            .scan(column, direction, visitor)
            .await
    }
}
