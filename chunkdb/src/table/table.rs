//! A table: one index per column, committed as a fresh descriptor chunk
//! plus a single registry update.

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use super::descriptor::{ColumnRecord, ColumnSpec, IndexKind, TableDescriptor};
use super::row::Row;
use crate::btree::{BTreeIndex, Direction};
use crate::error::ChunkDbError;
use crate::hashtrie::HashTrie;
use crate::key::{encode_key, IndexKey, Value};
use crate::store::{ChunkHash, ChunkStore, PayloadStore, Registry};

/// Degree used for every dispatcher-created ordered index.
const ORDERED_DEGREE: usize = 4;

/// A column's backing index, dispatched on the declared kind.
pub(crate) enum ColumnIndex {
    Ordered(BTreeIndex),
    Hashed(HashTrie),
}

impl ColumnIndex {
    async fn put(&mut self, key: IndexKey, value: ChunkHash) -> Result<Option<ChunkHash>> {
        match self {
            ColumnIndex::Ordered(tree) => tree.put(key, value).await,
            ColumnIndex::Hashed(trie) => trie.put(key, value).await,
        }
    }

    async fn get(&mut self, key: &IndexKey) -> Result<Option<ChunkHash>> {
        match self {
            ColumnIndex::Ordered(tree) => tree.get(key).await,
            ColumnIndex::Hashed(trie) => trie.get(key).await,
        }
    }

    async fn delete(&mut self, key: &IndexKey) -> Result<bool> {
        match self {
            ColumnIndex::Ordered(tree) => Ok(tree.delete(key).await?.is_some()),
            ColumnIndex::Hashed(trie) => trie.delete(key).await,
        }
    }

    async fn flush(&mut self) -> Result<ChunkHash> {
        match self {
            ColumnIndex::Ordered(tree) => tree.flush().await,
            ColumnIndex::Hashed(trie) => trie.flush().await,
        }
    }
}

pub(crate) struct ColumnState {
    pub(crate) spec: ColumnSpec,
    pub(crate) index: ColumnIndex,
}

/// Mutable table state guarded by the table's writer lock.
struct TableState {
    columns: Vec<ColumnState>,
    buffered: bool,
}

impl TableState {
    fn column_mut(&mut self, name: &str) -> Result<&mut ColumnState> {
        self.columns
            .iter_mut()
            .find(|column| column.spec.name == name)
            .ok_or_else(|| ChunkDbError::NoSuchColumn(name.to_string()).into())
    }

    fn primary_spec(&self) -> Result<ColumnSpec> {
        self.columns
            .iter()
            .find(|column| column.spec.primary)
            .map(|column| column.spec.clone())
            .ok_or_else(|| ChunkDbError::NoPrimaryColumn.into())
    }
}

/// A named table whose columns are content-addressed indices.
///
/// Writes are serialized by the table's own lock: one writer per table,
/// with distinct tables fully independent. Unless buffering is switched on
/// with [`start_buffer`](Table::start_buffer), every write commits before
/// returning: indices flush, the descriptor chunk is rewritten and the
/// registry entry moves to it.
pub struct Table {
    owner: String,
    name: String,
    bid: f64,
    replication: i64,
    encrypted: i64,
    store: Arc<dyn ChunkStore>,
    payloads: Arc<dyn PayloadStore>,
    registry: Arc<Registry>,
    state: Mutex<TableState>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("bid", &self.bid)
            .field("replication", &self.replication)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

impl Table {
    /// Materialize a table from its parsed descriptor. Column indices come
    /// up with unloaded roots and fault their nodes in on first access.
    pub(crate) fn from_descriptor(
        owner: &str,
        name: &str,
        descriptor: TableDescriptor,
        store: Arc<dyn ChunkStore>,
        payloads: Arc<dyn PayloadStore>,
        registry: Arc<Registry>,
    ) -> Result<Table> {
        let mut columns = Vec::with_capacity(descriptor.columns.len());
        for record in &descriptor.columns {
            let index = match record.spec.index_kind {
                IndexKind::OrderedTree => ColumnIndex::Ordered(BTreeIndex::open(
                    store.clone(),
                    ORDERED_DEGREE,
                    record.root,
                )?),
                IndexKind::HashTrie => {
                    ColumnIndex::Hashed(HashTrie::open(store.clone(), record.root))
                }
            };
            columns.push(ColumnState {
                spec: record.spec.clone(),
                index,
            });
        }
        Ok(Table {
            owner: owner.to_string(),
            name: name.to_string(),
            bid: descriptor.bid,
            replication: descriptor.replication,
            encrypted: descriptor.encrypted,
            store,
            payloads,
            registry,
            state: Mutex::new(TableState {
                columns,
                buffered: false,
            }),
        })
    }

    /// The owner this table was opened under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column declarations in descriptor order.
    pub async fn table_info(&self) -> Vec<ColumnSpec> {
        let state = self.state.lock().await;
        state.columns.iter().map(|column| column.spec.clone()).collect()
    }

    /// Write `row`, replacing any row with the same primary key.
    ///
    /// The primary column indexes the content hash of the row body in the
    /// payload store; each secondary column present in the row indexes the
    /// primary key. Absent secondary values are simply skipped.
    pub async fn put(&self, row: &Row) -> Result<()> {
        let mut state = self.state.lock().await;
        self.put_locked(&mut state, row).await?;
        if !state.buffered {
            self.commit(&mut state).await?;
        }
        Ok(())
    }

    /// Strict insert: fails with [`ChunkDbError::DuplicateKey`] when a row
    /// with the same primary key exists.
    pub async fn insert(&self, row: &Row) -> Result<()> {
        let mut state = self.state.lock().await;
        let primary = state.primary_spec()?;
        let primary_key = self.primary_key_from_row(&primary, row)?;
        if state
            .column_mut(&primary.name)?
            .index
            .get(&primary_key)
            .await?
            .is_some()
        {
            return Err(ChunkDbError::DuplicateKey(primary_key.to_string()).into());
        }
        self.put_locked(&mut state, row).await?;
        if !state.buffered {
            self.commit(&mut state).await?;
        }
        Ok(())
    }

    /// Fetch the row stored under the primary-key `value`.
    pub async fn get(&self, value: &Value) -> Result<Option<Row>> {
        let mut state = self.state.lock().await;
        let primary = state.primary_spec()?;
        let key = encode_key(primary.column_type, value)?;
        let Some(payload_hash) = state.column_mut(&primary.name)?.index.get(&key).await? else {
            return Ok(None);
        };
        let payload = self.payloads.get(&payload_hash).await?;
        Ok(Some(Row::from_payload(&payload)?))
    }

    /// Delete the row stored under the primary-key `value` from every
    /// column index, deriving secondary keys from the stored payload.
    /// Returns whether anything was removed.
    pub async fn delete(&self, value: &Value) -> Result<bool> {
        let mut state = self.state.lock().await;
        let primary = state.primary_spec()?;
        let key = encode_key(primary.column_type, value)?;
        let row = match state.column_mut(&primary.name)?.index.get(&key).await? {
            Some(payload_hash) => {
                let payload = self.payloads.get(&payload_hash).await?;
                Some(Row::from_payload(&payload)?)
            }
            None => None,
        };
        let mut removed = false;
        for column in state.columns.iter_mut() {
            if column.spec.primary {
                removed |= column.index.delete(&key).await?;
            } else if let Some(row) = &row {
                if let Some(value) = row.get(&column.spec.name) {
                    let secondary = encode_key(column.spec.column_type, value)?;
                    column.index.delete(&secondary).await?;
                }
            }
        }
        if removed && !state.buffered {
            self.commit(&mut state).await?;
        }
        Ok(removed)
    }

    /// Scan an ordered column in `direction`, feeding every `(key, value)`
    /// pair to `visitor`. Hash-trie columns cannot be scanned.
    pub async fn scan<F>(&self, column: &str, direction: Direction, visitor: F) -> Result<()>
    where
        F: FnMut(&IndexKey, &ChunkHash) -> ControlFlow<()> + Send,
    {
        let mut state = self.state.lock().await;
        let column_state = state.column_mut(column)?;
        match &mut column_state.index {
            ColumnIndex::Ordered(tree) => tree.scan(None, None, true, direction, visitor).await,
            ColumnIndex::Hashed(_) => Err(ChunkDbError::NotOrdered(column.to_string()).into()),
        }
    }

    /// Begin buffering: subsequent writes accumulate in memory until
    /// [`flush_buffer`](Table::flush_buffer). Starting a buffer while one
    /// is already active commits the pending writes first.
    pub async fn start_buffer(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.buffered {
            self.commit(&mut state).await?;
        }
        state.buffered = true;
        Ok(())
    }

    /// Commit buffered writes and return to write-through mode.
    pub async fn flush_buffer(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.commit(&mut state).await?;
        state.buffered = false;
        Ok(())
    }

    fn primary_key_from_row(&self, primary: &ColumnSpec, row: &Row) -> Result<IndexKey> {
        let Some(value) = row.get(&primary.name) else {
            return Err(ChunkDbError::MissingPrimaryValue(primary.name.clone()).into());
        };
        encode_key(primary.column_type, value)
    }

    async fn put_locked(&self, state: &mut TableState, row: &Row) -> Result<()> {
        let primary = state.primary_spec()?;
        let primary_key = self.primary_key_from_row(&primary, row)?;
        let payload = row.to_payload()?;
        let payload_hash = self.payloads.put(&payload).await?;
        tracing::debug!(table = %self.name, key = %primary_key, "put row");
        for column in state.columns.iter_mut() {
            if column.spec.primary {
                column.index.put(primary_key, payload_hash).await?;
            } else if let Some(value) = row.get(&column.spec.name) {
                let key = encode_key(column.spec.column_type, value)?;
                // Secondary entries point back at the owning row.
                column
                    .index
                    .put(key, ChunkHash::from_bytes(*primary_key.as_bytes()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Commit sequence: flush every column index (chunks first), store the
    /// rewritten descriptor, then move the registry entry. The registry is
    /// last, so a failure at any earlier step leaves the published roots
    /// untouched and the table retryable.
    async fn commit(&self, state: &mut TableState) -> Result<()> {
        let mut records = Vec::with_capacity(state.columns.len());
        for column in state.columns.iter_mut() {
            let root = column.index.flush().await?;
            records.push(ColumnRecord {
                spec: column.spec.clone(),
                root,
            });
        }
        let descriptor = TableDescriptor {
            columns: records,
            bid: self.bid,
            replication: self.replication,
            encrypted: self.encrypted,
        };
        let chunk = descriptor.serialize()?;
        let hash = self.store.store(&chunk).await?;
        self.registry.put_root(&self.name, &hash).await?;
        tracing::debug!(table = %self.name, root = %hash, "committed");
        Ok(())
    }
}
