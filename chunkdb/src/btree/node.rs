//! B-tree node types, copy-on-write plumbing and chunk serialization.

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::error::ChunkDbError;
use crate::key::{IndexKey, KEY_SIZE};
use crate::store::{ChunkHash, CHUNK_SIZE};

/// Bytes reserved for the item/child-count header.
const HEADER_SIZE: usize = 16;
/// One packed item: a 32-byte key followed by the 32-byte value hash.
const ITEM_SIZE: usize = 64;
/// Width of a packed child hash.
const CHILD_SIZE: usize = 32;

/// Largest degree whose full node (`2·degree−1` items plus `2·degree`
/// child hashes) still fits a single chunk.
pub(crate) const MAX_DEGREE: usize = 21;

/// Upper bound on free node shells kept for reuse.
const FREE_LIST_SIZE: usize = 32;

/// A single `(key, valueHash)` entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Item {
    pub(crate) key: IndexKey,
    pub(crate) value: ChunkHash,
}

/// A child reference: a content-hash stub until first touched, then the
/// loaded node itself. Loaded nodes are shared pointers so that cloned
/// trees can borrow each other's subtrees.
#[derive(Clone, Debug)]
pub(crate) enum Child {
    Stub(ChunkHash),
    Loaded(Arc<Node>),
}

impl Child {
    /// The current content hash of this child.
    ///
    /// A loaded child only knows its hash once it has been loaded from a
    /// chunk or flushed to one; asking earlier is a flush-ordering bug.
    pub(crate) fn hash(&self) -> Result<ChunkHash> {
        match self {
            Child::Stub(hash) => Ok(*hash),
            Child::Loaded(node) => node
                .hash
                .ok_or_else(|| anyhow::anyhow!("unflushed child has no hash")),
        }
    }
}

/// Bounded stack of reusable node shells, shared between every tree that
/// clones from a common ancestor.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    nodes: Mutex<Vec<Node>>,
}

impl FreeList {
    fn pop(&self) -> Option<Node> {
        self.nodes.lock().expect("free list lock").pop()
    }

    fn push(&self, node: Node) {
        let mut nodes = self.nodes.lock().expect("free list lock");
        if nodes.len() < FREE_LIST_SIZE {
            nodes.push(node);
        }
    }
}

/// Ownership token for copy-on-write.
///
/// A tree may mutate a node in place only when the node carries the tree's
/// own context. Contexts compare by identity, and cloning a tree mints
/// fresh contexts for both sides, which strands every already-shared node
/// in a state neither tree may touch in place.
#[derive(Clone, Debug)]
pub(crate) struct WriteContext {
    id: Arc<()>,
    free: Arc<FreeList>,
}

impl WriteContext {
    pub(crate) fn new() -> Self {
        WriteContext {
            id: Arc::new(()),
            free: Arc::new(FreeList::default()),
        }
    }

    /// A fresh identity sharing this context's free list.
    pub(crate) fn successor(&self) -> Self {
        WriteContext {
            id: Arc::new(()),
            free: self.free.clone(),
        }
    }

    pub(crate) fn matches(&self, other: &WriteContext) -> bool {
        Arc::ptr_eq(&self.id, &other.id)
    }

    /// Allocate an empty node owned by this context, reusing a free shell
    /// when one is available.
    pub(crate) fn new_node(&self) -> Node {
        let mut node = self.free.pop().unwrap_or_else(|| Node {
            items: Vec::new(),
            children: Vec::new(),
            dirty: true,
            hash: None,
            ctx: self.clone(),
        });
        node.items.clear();
        node.children.clear();
        node.dirty = true;
        node.hash = None;
        node.ctx = self.clone();
        node
    }

    /// Return a node shell to the free list. Nodes owned by other contexts
    /// are simply dropped.
    pub(crate) fn free_node(&self, node: Node) {
        if self.matches(&node.ctx) {
            self.free.push(node);
        }
    }
}

/// An in-memory B-tree node.
///
/// Freshly constructed and chunk-loaded nodes are always fully populated;
/// unloaded subtrees exist only as [`Child::Stub`]s. `dirty` means the
/// content has diverged from the chunk recorded in `hash`.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) items: Vec<Item>,
    pub(crate) children: Vec<Child>,
    pub(crate) dirty: bool,
    pub(crate) hash: Option<ChunkHash>,
    pub(crate) ctx: WriteContext,
}

impl Node {
    /// Copy this node for mutation under `ctx`: items are cloned, children
    /// are borrowed (stubs and shared loaded nodes alike).
    pub(crate) fn copy_for(&self, ctx: &WriteContext) -> Node {
        let mut copy = ctx.new_node();
        copy.items = self.items.clone();
        copy.children = self.children.clone();
        copy.hash = self.hash;
        copy.dirty = self.dirty;
        copy
    }

    /// Index at which `key` sits (`true`) or would be inserted (`false`).
    pub(crate) fn find(&self, key: &IndexKey) -> (usize, bool) {
        match self.items.binary_search_by(|item| item.key.cmp(key)) {
            Ok(index) => (index, true),
            Err(index) => (index, false),
        }
    }

    /// Split at item `index`: the median item is handed back to move up one
    /// level, everything after it moves into a new right sibling.
    pub(crate) fn split(&mut self, index: usize, ctx: &WriteContext) -> (Item, Node) {
        let median = self.items[index].clone();
        let mut right = ctx.new_node();
        right.items.extend(self.items.drain(index + 1..));
        self.items.truncate(index);
        if !self.children.is_empty() {
            right.children.extend(self.children.drain(index + 1..));
        }
        self.dirty = true;
        (median, right)
    }

    /// Serialize into a chunk: `[0:8]` item count, `[8:16]` child count,
    /// packed 64-byte items, then the child hashes, zeros to the end.
    /// Identical logical content always produces identical bytes.
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let needed =
            HEADER_SIZE + self.items.len() * ITEM_SIZE + self.children.len() * CHILD_SIZE;
        anyhow::ensure!(
            needed <= CHUNK_SIZE,
            "node does not fit a chunk: {needed} bytes"
        );
        let mut buf = vec![0u8; CHUNK_SIZE];
        buf[0..8].copy_from_slice(&(self.items.len() as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&(self.children.len() as u64).to_le_bytes());
        let mut offset = HEADER_SIZE;
        for item in &self.items {
            buf[offset..offset + KEY_SIZE].copy_from_slice(item.key.as_bytes());
            buf[offset + KEY_SIZE..offset + ITEM_SIZE].copy_from_slice(item.value.as_bytes());
            offset += ITEM_SIZE;
        }
        for child in &self.children {
            let hash = child.hash()?;
            buf[offset..offset + CHILD_SIZE].copy_from_slice(hash.as_bytes());
            offset += CHILD_SIZE;
        }
        Ok(buf)
    }

    /// Reconstruct a node from its chunk. Children come back as stubs.
    pub(crate) fn deserialize(bytes: &[u8], hash: &ChunkHash, ctx: &WriteContext) -> Result<Node> {
        if bytes.len() != CHUNK_SIZE {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                format!("expected {CHUNK_SIZE} bytes, got {}", bytes.len()),
            )
            .into());
        }
        let item_count = u64::from_le_bytes(bytes[0..8].try_into()?) as usize;
        let child_count = u64::from_le_bytes(bytes[8..16].try_into()?) as usize;
        if HEADER_SIZE + item_count * ITEM_SIZE + child_count * CHILD_SIZE > CHUNK_SIZE {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                format!("counts out of range: {item_count} items, {child_count} children"),
            )
            .into());
        }
        if child_count != 0 && child_count != item_count + 1 {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                format!("{child_count} children for {item_count} items"),
            )
            .into());
        }
        let mut node = ctx.new_node();
        let mut offset = HEADER_SIZE;
        for _ in 0..item_count {
            let key = IndexKey::from_bytes(bytes[offset..offset + KEY_SIZE].try_into()?);
            let value =
                ChunkHash::from_bytes(bytes[offset + KEY_SIZE..offset + ITEM_SIZE].try_into()?);
            node.items.push(Item { key, value });
            offset += ITEM_SIZE;
        }
        for _ in 0..child_count {
            let child = ChunkHash::from_bytes(bytes[offset..offset + CHILD_SIZE].try_into()?);
            node.children.push(Child::Stub(child));
            offset += CHILD_SIZE;
        }
        node.dirty = false;
        node.hash = Some(*hash);
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::key::{encode_key, ColumnType, Value};

    fn item(i: i64) -> Item {
        Item {
            key: encode_key(ColumnType::Integer, &Value::Integer(i)).expect("encodes"),
            value: ChunkHash::digest(&i.to_le_bytes()),
        }
    }

    #[test]
    fn it_serializes_deterministically() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.extend([item(1), item(2), item(3)]);
        let first = node.serialize().expect("serializes");
        let second = node.serialize().expect("serializes again");
        assert_eq!(first, second);
        assert_eq!(CHUNK_SIZE, first.len());
    }

    #[test]
    fn it_round_trips_leaf_nodes() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.extend([item(10), item(20), item(30)]);
        let bytes = node.serialize().expect("serializes");
        let hash = ChunkHash::digest(&bytes);
        let loaded = Node::deserialize(&bytes, &hash, &ctx).expect("deserializes");
        assert_eq!(node.items, loaded.items);
        assert!(loaded.children.is_empty());
        assert!(!loaded.dirty);
        assert_eq!(Some(hash), loaded.hash);
    }

    #[test]
    fn it_round_trips_internal_nodes() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.extend([item(10), item(20)]);
        node.children.extend([
            Child::Stub(ChunkHash::digest(b"left")),
            Child::Stub(ChunkHash::digest(b"middle")),
            Child::Stub(ChunkHash::digest(b"right")),
        ]);
        let bytes = node.serialize().expect("serializes");
        let hash = ChunkHash::digest(&bytes);
        let loaded = Node::deserialize(&bytes, &hash, &ctx).expect("deserializes");
        assert_eq!(node.items, loaded.items);
        assert_eq!(3, loaded.children.len());
        for (expected, child) in node.children.iter().zip(&loaded.children) {
            assert_eq!(
                expected.hash().expect("has hash"),
                child.hash().expect("has hash")
            );
        }
    }

    #[test]
    fn it_rejects_inconsistent_counts() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.extend([item(10), item(20)]);
        let mut bytes = node.serialize().expect("serializes");
        // Claim a single child: internal nodes need items + 1.
        bytes[8..16].copy_from_slice(&1u64.to_le_bytes());
        let hash = ChunkHash::digest(&bytes);
        let err = Node::deserialize(&bytes, &hash, &ctx).expect_err("must reject");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::CorruptChunk(_, _))
        ));
    }

    #[test]
    fn it_splits_around_the_median() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.extend((1..=7).map(item));
        let (median, right) = node.split(3, &ctx);
        assert_eq!(item(4), median);
        assert_eq!(vec![item(1), item(2), item(3)], node.items);
        assert_eq!(vec![item(5), item(6), item(7)], right.items);
        assert!(node.dirty && right.dirty);
    }

    #[test]
    fn it_refuses_foreign_context_reuse() {
        let ctx = WriteContext::new();
        let other = ctx.successor();
        assert!(!ctx.matches(&other));
        let node = ctx.new_node();
        // Freeing under a foreign context drops the shell instead.
        other.free_node(node);
        assert!(other.free.pop().is_none());
    }

    #[test]
    fn it_recycles_shells_through_the_free_list() {
        let ctx = WriteContext::new();
        let mut node = ctx.new_node();
        node.items.push(item(1));
        ctx.free_node(node);
        let reused = ctx.new_node();
        assert!(reused.items.is_empty());
        assert!(reused.dirty);
        assert!(reused.hash.is_none());
    }
}
