//! The table descriptor chunk: a single 4096-byte chunk binding up to 30
//! columns to their index roots.
//!
//! Layout: `[2048:4000]` holds up to 30 column records of 64 bytes each
//! (name, primary flag, type code, index-kind code, current root hash),
//! `[4000:4024]` the per-table bid, replication and encryption fields. The
//! leading 2048 bytes are reserved.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::error::ChunkDbError;
use crate::key::ColumnType;
use crate::store::{ChunkHash, CHUNK_SIZE};

const COLUMN_AREA_START: usize = 2048;
const COLUMN_AREA_END: usize = 4000;
const COLUMN_RECORD_SIZE: usize = 64;
const PRIMARY_OFFSET: usize = 26;
const TYPE_OFFSET: usize = 28;
const KIND_OFFSET: usize = 30;
const ROOT_OFFSET: usize = 32;

/// Maximum columns one descriptor holds.
pub const MAX_COLUMNS: usize = 30;

/// Longest permitted column name, in bytes.
pub const MAX_COLUMN_NAME: usize = 25;

/// Which index shape a column uses.
#[derive(Clone, Copy, Debug, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    /// Copy-on-write B-tree; supports point lookups and range scans.
    OrderedTree,
    /// 64-way hash trie; point lookups only.
    HashTrie,
}

impl IndexKind {
    fn code(self) -> u8 {
        match self {
            IndexKind::OrderedTree => 1,
            IndexKind::HashTrie => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(IndexKind::OrderedTree),
            2 => Some(IndexKind::HashTrie),
            _ => None,
        }
    }
}

/// One column as declared at table creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, at most 25 bytes.
    pub name: String,
    /// Whether this is the table's primary column.
    #[serde(default)]
    pub primary: bool,
    /// Value type of the column's keys.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Index shape backing the column.
    #[serde(rename = "index")]
    pub index_kind: IndexKind,
}

/// A column together with its current index root.
#[derive(Clone, Debug)]
pub struct ColumnRecord {
    /// Static column declaration.
    pub spec: ColumnSpec,
    /// Root of the column's index as of the last commit; the zero hash
    /// means the index is empty.
    pub root: ChunkHash,
}

/// A parsed descriptor: columns in stored order plus the per-table trailing
/// fields.
#[derive(Clone, Debug)]
pub struct TableDescriptor {
    /// Column records in stored order.
    pub columns: Vec<ColumnRecord>,
    /// Bid price carried for the hosting layer.
    pub bid: f64,
    /// Replication factor carried for the hosting layer.
    pub replication: i64,
    /// Whether row payloads are sealed by the hosting layer.
    pub encrypted: i64,
}

impl TableDescriptor {
    /// Build a fresh descriptor with every root empty, validating the
    /// schema: at most 30 columns, unique names that fit the 25-byte field,
    /// exactly one primary.
    pub fn new(columns: &[ColumnSpec], bid: f64, replication: i64, encrypted: i64) -> Result<Self> {
        if columns.len() > MAX_COLUMNS {
            return Err(ChunkDbError::TooManyColumns(columns.len()).into());
        }
        let mut primary_seen = false;
        let mut names = std::collections::HashSet::new();
        for spec in columns {
            if spec.name.is_empty() || spec.name.len() > MAX_COLUMN_NAME {
                return Err(ChunkDbError::InvalidColumnName(spec.name.clone()).into());
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ChunkDbError::DuplicateColumn(spec.name.clone()).into());
            }
            if spec.primary {
                if primary_seen {
                    return Err(ChunkDbError::MultiplePrimaryColumns(spec.name.clone()).into());
                }
                primary_seen = true;
            }
        }
        if !primary_seen {
            return Err(ChunkDbError::NoPrimaryColumn.into());
        }
        Ok(TableDescriptor {
            columns: columns
                .iter()
                .map(|spec| ColumnRecord {
                    spec: spec.clone(),
                    root: ChunkHash::ZERO,
                })
                .collect(),
            bid,
            replication,
            encrypted,
        })
    }

    /// The primary column record.
    pub fn primary(&self) -> Result<&ColumnRecord> {
        self.columns
            .iter()
            .find(|column| column.spec.primary)
            .ok_or_else(|| ChunkDbError::NoPrimaryColumn.into())
    }

    /// Serialize into the descriptor chunk layout.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        anyhow::ensure!(
            self.columns.len() <= MAX_COLUMNS,
            "descriptor overflow: {} columns",
            self.columns.len()
        );
        let mut buf = vec![0u8; CHUNK_SIZE];
        for (index, record) in self.columns.iter().enumerate() {
            let base = COLUMN_AREA_START + index * COLUMN_RECORD_SIZE;
            let name = record.spec.name.as_bytes();
            buf[base..base + name.len()].copy_from_slice(name);
            buf[base + PRIMARY_OFFSET] = record.spec.primary as u8;
            buf[base + TYPE_OFFSET] = record.spec.column_type.code();
            buf[base + KIND_OFFSET] = record.spec.index_kind.code();
            buf[base + ROOT_OFFSET..base + COLUMN_RECORD_SIZE]
                .copy_from_slice(record.root.as_bytes());
        }
        buf[4000..4008].copy_from_slice(&self.bid.to_le_bytes());
        buf[4008..4016].copy_from_slice(&self.replication.to_le_bytes());
        buf[4016..4024].copy_from_slice(&self.encrypted.to_le_bytes());
        Ok(buf)
    }

    /// Parse a descriptor chunk. Column records stop at the first vacant
    /// slot (leading name byte zero).
    pub fn deserialize(bytes: &[u8], hash: &ChunkHash) -> Result<Self> {
        if bytes.len() != CHUNK_SIZE {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                format!("expected {CHUNK_SIZE} bytes, got {}", bytes.len()),
            )
            .into());
        }
        let mut columns = Vec::new();
        let mut primary_seen = false;
        let mut base = COLUMN_AREA_START;
        while base + COLUMN_RECORD_SIZE <= COLUMN_AREA_END {
            if bytes[base] == 0 {
                break;
            }
            let name_field = &bytes[base..base + MAX_COLUMN_NAME];
            let end = name_field
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(MAX_COLUMN_NAME);
            let name = std::str::from_utf8(&name_field[..end])
                .map_err(|_| {
                    ChunkDbError::CorruptChunk(*hash, "column name is not UTF-8".to_string())
                })?
                .to_string();
            let primary = bytes[base + PRIMARY_OFFSET] != 0;
            let column_type = ColumnType::from_code(bytes[base + TYPE_OFFSET]).ok_or_else(|| {
                ChunkDbError::CorruptChunk(
                    *hash,
                    format!("unknown column type code {}", bytes[base + TYPE_OFFSET]),
                )
            })?;
            let index_kind = IndexKind::from_code(bytes[base + KIND_OFFSET]).ok_or_else(|| {
                ChunkDbError::CorruptChunk(
                    *hash,
                    format!("unknown index kind code {}", bytes[base + KIND_OFFSET]),
                )
            })?;
            if primary {
                if primary_seen {
                    return Err(ChunkDbError::MultiplePrimaryColumns(name).into());
                }
                primary_seen = true;
            }
            let root = ChunkHash::from_bytes(
                bytes[base + ROOT_OFFSET..base + COLUMN_RECORD_SIZE].try_into()?,
            );
            columns.push(ColumnRecord {
                spec: ColumnSpec {
                    name,
                    primary,
                    column_type,
                    index_kind,
                },
                root,
            });
            base += COLUMN_RECORD_SIZE;
        }
        if !primary_seen {
            return Err(ChunkDbError::NoPrimaryColumn.into());
        }
        Ok(TableDescriptor {
            columns,
            bid: f64::from_le_bytes(bytes[4000..4008].try_into()?),
            replication: i64::from_le_bytes(bytes[4008..4016].try_into()?),
            encrypted: i64::from_le_bytes(bytes[4016..4024].try_into()?),
        })
    }
}
