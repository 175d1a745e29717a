//! Hash-trie node shapes and their chunk serialization.
//!
//! The trie is keyed by the SHA-256 digest of the 32-byte encoded key,
//! consumed six bits per level. Interior chunks carry a tag of 1, their
//! level and 64 child-hash slots; leaf chunks carry a tag of 0, the value
//! hash and the key bytes with trailing zero padding trimmed.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::error::ChunkDbError;
use crate::key::IndexKey;
use crate::store::{ChunkHash, CHUNK_SIZE};

/// Slots per interior node.
pub(crate) const FAN_OUT: usize = 64;

/// Maximum trie depth: ⌈256 / 6⌉ levels of six digest bits.
pub(crate) const MAX_DEPTH: usize = 43;

const INTERIOR_TAG: u64 = 1;
const LEAF_TAG: u64 = 0;
const SLOTS_OFFSET: usize = 64;
const VALUE_OFFSET: usize = 64;
const KEY_OFFSET: usize = 96;

/// Digest of the full 32-byte encoded key. Drives slot selection at every
/// level.
pub(crate) fn key_digest(key: &IndexKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// The 6-bit slot index for `level`: bits `[6·level, 6·level + 6)` of the
/// digest, most significant bit first. The deepest level has only four
/// digest bits left; the missing low bits read as zero.
pub(crate) fn slot_index(digest: &[u8; 32], level: usize) -> usize {
    let base = level * 6;
    let mut value = 0usize;
    for offset in 0..6 {
        let position = base + offset;
        value <<= 1;
        if position < 256 {
            let byte = digest[position / 8];
            value |= ((byte >> (7 - position % 8)) & 1) as usize;
        }
    }
    value
}

/// A slot in an interior node: vacant, a child hash not yet loaded, or the
/// loaded child itself.
#[derive(Debug)]
pub(crate) enum Slot {
    Empty,
    Stub(ChunkHash),
    Node(Box<TrieNode>),
}

impl Slot {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// The content hash to pack into the parent chunk; the zero hash marks a
    /// vacant slot.
    fn packed_hash(&self) -> Result<ChunkHash> {
        match self {
            Slot::Empty => Ok(ChunkHash::ZERO),
            Slot::Stub(hash) => Ok(*hash),
            Slot::Node(node) => node
                .hash()
                .ok_or_else(|| anyhow::anyhow!("unflushed trie child has no hash")),
        }
    }
}

/// An in-memory trie node: interior fan-out or a single key/value leaf.
#[derive(Debug)]
pub(crate) enum TrieNode {
    Interior(Interior),
    Leaf(Leaf),
}

/// A 64-way fan-out node.
#[derive(Debug)]
pub(crate) struct Interior {
    pub(crate) level: usize,
    pub(crate) slots: Vec<Slot>,
    pub(crate) dirty: bool,
    pub(crate) hash: Option<ChunkHash>,
}

/// A single `(key, valueHash)` pair; the key is held in trimmed form.
#[derive(Debug)]
pub(crate) struct Leaf {
    pub(crate) key: Vec<u8>,
    pub(crate) value: ChunkHash,
    pub(crate) dirty: bool,
    pub(crate) hash: Option<ChunkHash>,
}

impl Interior {
    /// A fresh all-vacant interior at `level`.
    pub(crate) fn empty(level: usize) -> Self {
        let mut slots = Vec::with_capacity(FAN_OUT);
        slots.resize_with(FAN_OUT, || Slot::Empty);
        Interior {
            level,
            slots,
            dirty: true,
            hash: None,
        }
    }

    /// Number of non-vacant slots.
    pub(crate) fn child_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }

    /// Index of the single non-vacant slot, if there is exactly one.
    pub(crate) fn sole_child_index(&self) -> Option<usize> {
        let mut found = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some(index);
            }
        }
        found
    }
}

impl Leaf {
    /// A fresh unflushed leaf for `key`.
    pub(crate) fn new(key: &IndexKey, value: ChunkHash) -> Self {
        Leaf {
            key: key.trimmed().to_vec(),
            value,
            dirty: true,
            hash: None,
        }
    }

    /// The full 32-byte key this leaf stores.
    pub(crate) fn index_key(&self) -> IndexKey {
        IndexKey::from_trimmed(&self.key)
    }
}

impl TrieNode {
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, TrieNode::Leaf(_))
    }

    pub(crate) fn dirty(&self) -> bool {
        match self {
            TrieNode::Interior(interior) => interior.dirty,
            TrieNode::Leaf(leaf) => leaf.dirty,
        }
    }

    pub(crate) fn hash(&self) -> Option<ChunkHash> {
        match self {
            TrieNode::Interior(interior) => interior.hash,
            TrieNode::Leaf(leaf) => leaf.hash,
        }
    }

    pub(crate) fn set_clean(&mut self, hash: ChunkHash) {
        match self {
            TrieNode::Interior(interior) => {
                interior.dirty = false;
                interior.hash = Some(hash);
            }
            TrieNode::Leaf(leaf) => {
                leaf.dirty = false;
                leaf.hash = Some(hash);
            }
        }
    }

    /// Serialize into a chunk. Interior: tag 1, level, then 64 slot hashes
    /// with the zero hash marking vacancy. Leaf: tag 0, value hash at
    /// `[64:96]`, trimmed key bytes from `[96]`.
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match self {
            TrieNode::Interior(interior) => {
                buf[0..8].copy_from_slice(&INTERIOR_TAG.to_le_bytes());
                buf[8..16].copy_from_slice(&(interior.level as u64).to_le_bytes());
                for (index, slot) in interior.slots.iter().enumerate() {
                    let offset = SLOTS_OFFSET + index * 32;
                    buf[offset..offset + 32].copy_from_slice(slot.packed_hash()?.as_bytes());
                }
            }
            TrieNode::Leaf(leaf) => {
                buf[0..8].copy_from_slice(&LEAF_TAG.to_le_bytes());
                buf[VALUE_OFFSET..VALUE_OFFSET + 32].copy_from_slice(leaf.value.as_bytes());
                buf[KEY_OFFSET..KEY_OFFSET + leaf.key.len()].copy_from_slice(&leaf.key);
            }
        }
        Ok(buf)
    }

    /// Reconstruct a node from its chunk, dispatching on the header tag.
    pub(crate) fn deserialize(bytes: &[u8], hash: &ChunkHash) -> Result<TrieNode> {
        if bytes.len() != CHUNK_SIZE {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                format!("expected {CHUNK_SIZE} bytes, got {}", bytes.len()),
            )
            .into());
        }
        let tag = u64::from_le_bytes(bytes[0..8].try_into()?);
        match tag {
            INTERIOR_TAG => {
                let level = u64::from_le_bytes(bytes[8..16].try_into()?) as usize;
                if level >= MAX_DEPTH {
                    return Err(ChunkDbError::CorruptChunk(
                        *hash,
                        format!("interior level {level} exceeds maximum depth"),
                    )
                    .into());
                }
                let mut interior = Interior::empty(level);
                for index in 0..FAN_OUT {
                    let offset = SLOTS_OFFSET + index * 32;
                    let child = ChunkHash::from_bytes(bytes[offset..offset + 32].try_into()?);
                    if !child.is_zero() {
                        interior.slots[index] = Slot::Stub(child);
                    }
                }
                interior.dirty = false;
                interior.hash = Some(*hash);
                Ok(TrieNode::Interior(interior))
            }
            LEAF_TAG => {
                let value = ChunkHash::from_bytes(bytes[VALUE_OFFSET..VALUE_OFFSET + 32].try_into()?);
                let region = &bytes[KEY_OFFSET..KEY_OFFSET + 32];
                let end = region
                    .iter()
                    .rposition(|b| *b != 0)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                Ok(TrieNode::Leaf(Leaf {
                    key: region[..end].to_vec(),
                    value,
                    dirty: false,
                    hash: Some(*hash),
                }))
            }
            tag => Err(ChunkDbError::CorruptChunk(*hash, format!("unrecognized tag {tag}")).into()),
        }
    }
}
