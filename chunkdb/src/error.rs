//! Error kinds surfaced by the database core.

use thiserror::Error;

use crate::key::ColumnType;
use crate::store::ChunkHash;

/// Typed failures raised by the chunk store, the indices and the table
/// layer.
///
/// Plain I/O failures are not wrapped here; they travel unchanged through
/// the [`anyhow::Error`] chain so callers can still downcast to
/// [`std::io::Error`].
#[derive(Error, Debug)]
pub enum ChunkDbError {
    /// No chunk is stored under this hash.
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkHash),

    /// Chunks are exactly [`CHUNK_SIZE`](crate::store::CHUNK_SIZE) bytes.
    #[error("chunk must be 4096 bytes, got {0}")]
    ChunkLength(usize),

    /// Retrieved bytes do not hash to the requested address, or the chunk
    /// header is malformed.
    #[error("corrupt chunk {0}: {1}")]
    CorruptChunk(ChunkHash, String),

    /// The registry has no root recorded under this name.
    #[error("no root hash registered for table: {0}")]
    RootNotFound(String),

    /// Strict insert found the key already present.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Table schema declares no primary column.
    #[error("table schema has no primary column")]
    NoPrimaryColumn,

    /// Table schema declares more than one primary column.
    #[error("column {0} marked primary, but the table already has a primary")]
    MultiplePrimaryColumns(String),

    /// Table schema exceeds the 30-column descriptor capacity.
    #[error("table has {0} columns, maximum is 30")]
    TooManyColumns(usize),

    /// Two columns share a name.
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),

    /// Column names must be non-empty and fit the 25-byte descriptor field.
    #[error("invalid column name: {0:?}")]
    InvalidColumnName(String),

    /// Table names must be non-empty and free of path separators.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The named column does not exist in the table.
    #[error("no such column: {0}")]
    NoSuchColumn(String),

    /// Range scans are only valid on ordered columns.
    #[error("column {0} is not ordered, cannot scan")]
    NotOrdered(String),

    /// B-tree degree must fall in `2..=21` so a full node fits one chunk.
    #[error("degree {0} out of range (2..=21)")]
    DegreeOutOfRange(usize),

    /// The row carries no value for the primary column.
    #[error("primary column {0} missing from row")]
    MissingPrimaryValue(String),

    /// The supplied value cannot be encoded under the column's type.
    #[error("value {0} cannot be encoded as {1}")]
    TypeMismatch(String, ColumnType),
}

impl ChunkDbError {
    /// Process exit code for this error kind, per the host CLI contract:
    /// 1 io-error, 2 not-found, 3 duplicate-key, 4 invalid-request,
    /// 5 invalid-schema.
    pub fn exit_code(&self) -> u8 {
        match self {
            ChunkDbError::CorruptChunk(_, _) => 1,
            ChunkDbError::ChunkNotFound(_) | ChunkDbError::RootNotFound(_) => 2,
            ChunkDbError::DuplicateKey(_) => 3,
            ChunkDbError::ChunkLength(_)
            | ChunkDbError::InvalidTableName(_)
            | ChunkDbError::NoSuchColumn(_)
            | ChunkDbError::NotOrdered(_)
            | ChunkDbError::DegreeOutOfRange(_)
            | ChunkDbError::MissingPrimaryValue(_)
            | ChunkDbError::TypeMismatch(_, _) => 4,
            ChunkDbError::NoPrimaryColumn
            | ChunkDbError::MultiplePrimaryColumns(_)
            | ChunkDbError::TooManyColumns(_)
            | ChunkDbError::DuplicateColumn(_)
            | ChunkDbError::InvalidColumnName(_) => 5,
        }
    }
}
