//! The unordered index: a 64-way digest trie persisted as content-addressed
//! chunks. Point operations only; there is no meaningful key order to scan.

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use super::node::{key_digest, slot_index, Interior, Leaf, Slot, TrieNode, MAX_DEPTH};
use crate::error::ChunkDbError;
use crate::key::IndexKey;
use crate::store::{retrieve_expected, ChunkHash, ChunkStore};

/// An unordered key/value index keyed by the SHA-256 digest of the key,
/// six bits per level.
///
/// A singleton trie is just a leaf; two or more entries grow interior nodes
/// exactly as deep as their digest prefixes collide. Deletion collapses any
/// interior left with a single leaf child, so the shape is canonical for the
/// content.
pub struct HashTrie {
    store: Arc<dyn ChunkStore>,
    root: Slot,
}

impl HashTrie {
    /// Create an empty index.
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        HashTrie {
            store,
            root: Slot::Empty,
        }
    }

    /// Open an index rooted at `root`. The zero hash denotes an empty index;
    /// anything else stays a stub until first touched.
    pub fn open(store: Arc<dyn ChunkStore>, root: ChunkHash) -> Self {
        let mut trie = HashTrie::new(store);
        if !root.is_zero() {
            trie.root = Slot::Stub(root);
        }
        trie
    }

    /// Insert or replace `key`, returning the previous value hash when the
    /// key was already present.
    pub async fn put(&mut self, key: IndexKey, value: ChunkHash) -> Result<Option<ChunkHash>> {
        let digest = key_digest(&key);
        let store = self.store.clone();
        put_slot(&mut self.root, 0, &digest, &key, value, &store).await
    }

    /// Strict insert: fails with [`ChunkDbError::DuplicateKey`] when the key
    /// is already present.
    pub async fn insert(&mut self, key: IndexKey, value: ChunkHash) -> Result<()> {
        if self.get(&key).await?.is_some() {
            return Err(ChunkDbError::DuplicateKey(key.to_string()).into());
        }
        self.put(key, value).await?;
        Ok(())
    }

    /// Look up `key`.
    pub async fn get(&mut self, key: &IndexKey) -> Result<Option<ChunkHash>> {
        let digest = key_digest(key);
        let store = self.store.clone();
        let mut slot = &mut self.root;
        let mut level = 0;
        loop {
            ensure_slot_loaded(slot, store.as_ref(), level).await?;
            match slot {
                Slot::Empty => return Ok(None),
                Slot::Node(node) => match node.as_mut() {
                    TrieNode::Leaf(leaf) => {
                        if leaf.key == key.trimmed() {
                            return Ok(Some(leaf.value));
                        }
                        return Ok(None);
                    }
                    TrieNode::Interior(interior) => {
                        let index = slot_index(&digest, level);
                        slot = &mut interior.slots[index];
                        level += 1;
                    }
                },
                Slot::Stub(_) => unreachable!("slot was just loaded"),
            }
        }
    }

    /// Remove `key`. Returns whether an entry was removed.
    ///
    /// On the way back up, any interior left with exactly one child that is
    /// a leaf is replaced by that leaf, all the way to the root.
    pub async fn delete(&mut self, key: &IndexKey) -> Result<bool> {
        let digest = key_digest(key);
        let store = self.store.clone();
        delete_slot(&mut self.root, 0, &digest, key, &store).await
    }

    /// Store every dirty node bottom-up and return the new root address.
    /// An empty index flushes to [`ChunkHash::ZERO`]; a clean one returns
    /// its existing root and stores nothing new.
    pub async fn flush(&mut self) -> Result<ChunkHash> {
        let store = self.store.clone();
        match &mut self.root {
            Slot::Empty => Ok(ChunkHash::ZERO),
            Slot::Stub(hash) => Ok(*hash),
            Slot::Node(node) => flush_node(node, &store).await,
        }
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Slot {
        &self.root
    }
}

/// Resolve a stub slot by reading its chunk; interiors are checked against
/// the depth the traversal expects.
async fn ensure_slot_loaded(slot: &mut Slot, store: &dyn ChunkStore, level: usize) -> Result<()> {
    if level >= MAX_DEPTH {
        return Err(anyhow::anyhow!("trie descent beyond maximum depth"));
    }
    if let Slot::Stub(hash) = slot {
        let bytes = retrieve_expected(store, hash).await?;
        let node = TrieNode::deserialize(&bytes, hash)?;
        if let TrieNode::Interior(interior) = &node {
            if interior.level != level {
                return Err(ChunkDbError::CorruptChunk(
                    *hash,
                    format!("interior at level {} reached at depth {level}", interior.level),
                )
                .into());
            }
        }
        *slot = Slot::Node(Box::new(node));
    }
    Ok(())
}

fn put_slot<'a>(
    slot: &'a mut Slot,
    level: usize,
    digest: &'a [u8; 32],
    key: &'a IndexKey,
    value: ChunkHash,
    store: &'a Arc<dyn ChunkStore>,
) -> BoxFuture<'a, Result<Option<ChunkHash>>> {
    Box::pin(async move {
        ensure_slot_loaded(slot, store.as_ref(), level).await?;
        match slot {
            Slot::Empty => {
                *slot = Slot::Node(Box::new(TrieNode::Leaf(Leaf::new(key, value))));
                Ok(None)
            }
            Slot::Node(node) => match node.as_mut() {
                TrieNode::Leaf(leaf) => {
                    if leaf.key == key.trimmed() {
                        let previous = std::mem::replace(&mut leaf.value, value);
                        leaf.dirty = true;
                        leaf.hash = None;
                        return Ok(Some(previous));
                    }
                    // Two distinct keys collide through this level: grow an
                    // interior here and reinsert both. The chain deepens
                    // until their 6-bit prefixes diverge.
                    let existing =
                        std::mem::replace(node.as_mut(), TrieNode::Interior(Interior::empty(level)));
                    let TrieNode::Leaf(existing) = existing else {
                        unreachable!("leaf was just matched");
                    };
                    let existing_digest = key_digest(&existing.index_key());
                    let TrieNode::Interior(interior) = node.as_mut() else {
                        unreachable!("interior was just installed");
                    };
                    let existing_index = slot_index(&existing_digest, level);
                    interior.slots[existing_index] = Slot::Node(Box::new(TrieNode::Leaf(existing)));
                    let index = slot_index(digest, level);
                    put_slot(&mut interior.slots[index], level + 1, digest, key, value, store).await
                }
                TrieNode::Interior(interior) => {
                    interior.dirty = true;
                    interior.hash = None;
                    let index = slot_index(digest, level);
                    put_slot(&mut interior.slots[index], level + 1, digest, key, value, store).await
                }
            },
            Slot::Stub(_) => unreachable!("slot was just loaded"),
        }
    })
}

fn delete_slot<'a>(
    slot: &'a mut Slot,
    level: usize,
    digest: &'a [u8; 32],
    key: &'a IndexKey,
    store: &'a Arc<dyn ChunkStore>,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        ensure_slot_loaded(slot, store.as_ref(), level).await?;
        match slot {
            Slot::Empty => Ok(false),
            Slot::Node(node) => match node.as_mut() {
                TrieNode::Leaf(leaf) => {
                    if leaf.key != key.trimmed() {
                        return Ok(false);
                    }
                    *slot = Slot::Empty;
                    Ok(true)
                }
                TrieNode::Interior(interior) => {
                    let index = slot_index(digest, level);
                    let removed =
                        delete_slot(&mut interior.slots[index], level + 1, digest, key, store)
                            .await?;
                    if !removed {
                        return Ok(false);
                    }
                    interior.dirty = true;
                    interior.hash = None;
                    if let Some(only) = interior.sole_child_index() {
                        // The surviving child's shape decides the pull-up,
                        // so a stub has to be loaded to know.
                        ensure_slot_loaded(&mut interior.slots[only], store.as_ref(), level + 1)
                            .await?;
                        if matches!(&interior.slots[only], Slot::Node(child) if child.is_leaf()) {
                            let child = std::mem::replace(&mut interior.slots[only], Slot::Empty);
                            *slot = child;
                        }
                    } else if interior.child_count() == 0 {
                        *slot = Slot::Empty;
                    }
                    Ok(true)
                }
            },
            Slot::Stub(_) => unreachable!("slot was just loaded"),
        }
    })
}

fn flush_node<'a>(
    node: &'a mut TrieNode,
    store: &'a Arc<dyn ChunkStore>,
) -> BoxFuture<'a, Result<ChunkHash>> {
    Box::pin(async move {
        if !node.dirty() {
            if let Some(hash) = node.hash() {
                return Ok(hash);
            }
        }
        if let TrieNode::Interior(interior) = node {
            for slot in interior.slots.iter_mut() {
                if let Slot::Node(child) = slot {
                    if child.dirty() {
                        flush_node(child, store).await?;
                    }
                }
            }
        }
        let bytes = node.serialize()?;
        let hash = store.store(&bytes).await?;
        tracing::debug!(node = %hash, leaf = node.is_leaf(), "flushed trie node");
        node.set_clean(hash);
        Ok(hash)
    })
}
