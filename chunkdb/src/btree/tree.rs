//! The ordered index: a copy-on-write B-tree persisted as content-addressed
//! chunks.
//!
//! Lookups and scans load nodes lazily by hash. Writes buffer dirty nodes in
//! memory until [`BTreeIndex::flush`] rehashes the modified subtree
//! bottom-up, stores the new chunks and returns the new root address.

use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use strum::EnumString;

use super::node::{Child, Item, Node, WriteContext, MAX_DEGREE};
use crate::error::ChunkDbError;
use crate::key::IndexKey;
use crate::store::{retrieve_expected, ChunkHash, ChunkStore};

/// Traversal order for scans.
#[derive(Clone, Copy, Debug, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    /// Smallest key first.
    Ascending,
    /// Largest key first.
    Descending,
}

/// An ordered key/value index of configurable degree.
///
/// Every non-root node holds between `degree − 1` and `2·degree − 1` items;
/// internal nodes hold one more child than items. The tree supports point
/// reads and writes plus range scans in either direction.
pub struct BTreeIndex {
    store: Arc<dyn ChunkStore>,
    degree: usize,
    root: Child,
    ctx: WriteContext,
}

impl std::fmt::Debug for BTreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndex")
            .field("degree", &self.degree)
            .field("root", &self.root)
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// What a remove call is looking for.
#[derive(Clone, Copy)]
enum Removal<'k> {
    /// Remove this key.
    Key(&'k IndexKey),
    /// Remove the smallest item in the subtree.
    Min,
    /// Remove the largest item in the subtree.
    Max,
}

impl BTreeIndex {
    /// Create an empty index of the given degree.
    pub fn new(store: Arc<dyn ChunkStore>, degree: usize) -> Result<Self> {
        if !(2..=MAX_DEGREE).contains(&degree) {
            return Err(ChunkDbError::DegreeOutOfRange(degree).into());
        }
        let ctx = WriteContext::new();
        let root = Child::Loaded(Arc::new(ctx.new_node()));
        Ok(BTreeIndex {
            store,
            degree,
            root,
            ctx,
        })
    }

    /// Open an index rooted at `root`. The zero hash denotes an empty index;
    /// anything else stays a stub until first touched.
    pub fn open(store: Arc<dyn ChunkStore>, degree: usize, root: ChunkHash) -> Result<Self> {
        let mut index = BTreeIndex::new(store, degree)?;
        if !root.is_zero() {
            index.root = Child::Stub(root);
        }
        Ok(index)
    }

    /// The configured degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    fn max_items(&self) -> usize {
        self.degree * 2 - 1
    }

    fn min_items(&self) -> usize {
        self.degree - 1
    }

    /// Cheap clone: shares every loaded node with `self`, and both trees
    /// receive fresh write contexts so neither may mutate shared nodes in
    /// place.
    pub fn clone_tree(&mut self) -> BTreeIndex {
        let clone_ctx = self.ctx.successor();
        self.ctx = self.ctx.successor();
        BTreeIndex {
            store: self.store.clone(),
            degree: self.degree,
            root: self.root.clone(),
            ctx: clone_ctx,
        }
    }

    /// Load the root if it is still a stub and return a handle this tree's
    /// context may write through.
    async fn root_mut(&mut self) -> Result<&mut Node> {
        if let Child::Stub(hash) = &self.root {
            let bytes = retrieve_expected(self.store.as_ref(), hash).await?;
            let node = Node::deserialize(&bytes, hash, &self.ctx)?;
            self.root = Child::Loaded(Arc::new(node));
        }
        match &mut self.root {
            Child::Loaded(node) => {
                if !self.ctx.matches(&node.ctx) {
                    let copied = node.copy_for(&self.ctx);
                    *node = Arc::new(copied);
                }
                Ok(Arc::make_mut(node))
            }
            Child::Stub(_) => unreachable!("root was just loaded"),
        }
    }

    /// Insert or replace `key`, returning the previous value hash when the
    /// key was already present.
    pub async fn put(&mut self, key: IndexKey, value: ChunkHash) -> Result<Option<ChunkHash>> {
        let max_items = self.max_items();
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let root = self.root_mut().await?;
        if root.items.len() >= max_items {
            // Split the root first: the median becomes the sole item of a
            // fresh root whose two children are the old root and its new
            // right sibling.
            let (median, right) = root.split(max_items / 2, &ctx);
            let old_root = std::mem::replace(root, ctx.new_node());
            root.items.push(median);
            root.children.push(Child::Loaded(Arc::new(old_root)));
            root.children.push(Child::Loaded(Arc::new(right)));
        }
        insert_node(root, Item { key, value }, max_items, &store, &ctx).await
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
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let mut node = self.root_mut().await?;
        loop {
            let (index, found) = node.find(key);
            if found {
                return Ok(Some(node.items[index].value));
            }
            if node.children.is_empty() {
                return Ok(None);
            }
            node.ensure_loaded(index, store.as_ref(), &ctx).await?;
            node = node.mutable_child(index, &ctx)?;
        }
    }

    /// Remove `key`, returning the value hash it held.
    pub async fn delete(&mut self, key: &IndexKey) -> Result<Option<ChunkHash>> {
        let removed = self.delete_inner(Removal::Key(key)).await?;
        Ok(removed.map(|item| item.value))
    }

    /// Remove and return the smallest entry.
    pub async fn delete_min(&mut self) -> Result<Option<(IndexKey, ChunkHash)>> {
        let removed = self.delete_inner(Removal::Min).await?;
        Ok(removed.map(|item| (item.key, item.value)))
    }

    /// Remove and return the largest entry.
    pub async fn delete_max(&mut self) -> Result<Option<(IndexKey, ChunkHash)>> {
        let removed = self.delete_inner(Removal::Max).await?;
        Ok(removed.map(|item| (item.key, item.value)))
    }

    async fn delete_inner(&mut self, removal: Removal<'_>) -> Result<Option<Item>> {
        let min_items = self.min_items();
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let root = self.root_mut().await?;
        if root.items.is_empty() && root.children.is_empty() {
            return Ok(None);
        }
        let removed = remove_node(root, removal, min_items, &store, &ctx).await?;
        // A root emptied down to a single child is discarded.
        if root.items.is_empty() && root.children.len() == 1 {
            root.ensure_loaded(0, store.as_ref(), &ctx).await?;
            let only = root.children.remove(0);
            let Child::Loaded(child) = only else {
                return Err(anyhow::anyhow!("collapsed root child not loaded"));
            };
            let child = Arc::try_unwrap(child).unwrap_or_else(|shared| (*shared).clone());
            let old_root = std::mem::replace(root, child);
            ctx.free_node(old_root);
        }
        Ok(removed)
    }

    /// Visit entries in order. Ascending visits keys in `start ≤ k < stop`,
    /// descending `stop < k ≤ start`, with an open end wherever a bound is
    /// `None`. `include_start` controls whether a key equal to `start` is
    /// visited. The visitor halts the traversal by returning
    /// [`ControlFlow::Break`].
    pub async fn scan<F>(
        &mut self,
        start: Option<&IndexKey>,
        stop: Option<&IndexKey>,
        include_start: bool,
        direction: Direction,
        mut visitor: F,
    ) -> Result<()>
    where
        F: FnMut(&IndexKey, &ChunkHash) -> ControlFlow<()> + Send,
    {
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let root = self.root_mut().await?;
        iterate_node(
            root,
            start,
            stop,
            include_start,
            direction,
            false,
            &mut visitor,
            &store,
            &ctx,
        )
        .await?;
        Ok(())
    }

    /// Rehash and store every dirty node bottom-up, returning the new root
    /// address. An empty index flushes to [`ChunkHash::ZERO`] without
    /// touching the store; a clean index returns its existing root and
    /// stores nothing new.
    pub async fn flush(&mut self) -> Result<ChunkHash> {
        let store = self.store.clone();
        match &mut self.root {
            Child::Stub(hash) => Ok(*hash),
            Child::Loaded(node) => {
                if node.items.is_empty() && node.children.is_empty() {
                    return Ok(ChunkHash::ZERO);
                }
                if !node.dirty {
                    return node
                        .hash
                        .ok_or_else(|| anyhow::anyhow!("clean root without a hash"));
                }
                // A dirty node belongs to this tree, so the handle is ours.
                let root = Arc::make_mut(node);
                flush_node(root, &store).await
            }
        }
    }

    /// Walk the whole tree checking the B-tree shape invariants.
    pub async fn verify(&mut self) -> Result<()> {
        let min_items = self.min_items();
        let max_items = self.max_items();
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let root = self.root_mut().await?;
        verify_node(root, true, min_items, max_items, None, None, &store, &ctx).await
    }
}

impl Node {
    /// Resolve child `index` from its stub, reading the chunk on first
    /// touch.
    pub(crate) async fn ensure_loaded(
        &mut self,
        index: usize,
        store: &dyn ChunkStore,
        ctx: &WriteContext,
    ) -> Result<()> {
        if let Child::Stub(hash) = &self.children[index] {
            let bytes = retrieve_expected(store, hash).await?;
            let node = Node::deserialize(&bytes, hash, ctx)?;
            self.children[index] = Child::Loaded(Arc::new(node));
        }
        Ok(())
    }

    /// Shared reference to the loaded child at `index`.
    pub(crate) fn child(&self, index: usize) -> Result<&Node> {
        match &self.children[index] {
            Child::Loaded(node) => Ok(node),
            Child::Stub(_) => Err(anyhow::anyhow!("child {index} not loaded")),
        }
    }

    /// Writable handle on the loaded child at `index`, copying it first when
    /// it belongs to a different context.
    pub(crate) fn mutable_child(&mut self, index: usize, ctx: &WriteContext) -> Result<&mut Node> {
        match &mut self.children[index] {
            Child::Loaded(node) => {
                if !ctx.matches(&node.ctx) {
                    let copied = node.copy_for(ctx);
                    *node = Arc::new(copied);
                }
                Ok(Arc::make_mut(node))
            }
            Child::Stub(_) => Err(anyhow::anyhow!("child {index} not loaded")),
        }
    }
}

fn insert_node<'a>(
    node: &'a mut Node,
    item: Item,
    max_items: usize,
    store: &'a Arc<dyn ChunkStore>,
    ctx: &'a WriteContext,
) -> BoxFuture<'a, Result<Option<ChunkHash>>> {
    Box::pin(async move {
        // Every node on the mutation path is marked dirty, replacements
        // included.
        node.dirty = true;
        let (mut index, found) = node.find(&item.key);
        if found {
            let previous = std::mem::replace(&mut node.items[index], item);
            return Ok(Some(previous.value));
        }
        if node.children.is_empty() {
            node.items.insert(index, item);
            return Ok(None);
        }
        node.ensure_loaded(index, store.as_ref(), ctx).await?;
        if node.child(index)?.items.len() >= max_items {
            // Split the full child before descending into it.
            let (median, right) = {
                let child = node.mutable_child(index, ctx)?;
                child.split(max_items / 2, ctx)
            };
            node.items.insert(index, median);
            node.children.insert(index + 1, Child::Loaded(Arc::new(right)));
            match item.key.cmp(&node.items[index].key) {
                Ordering::Less => {}
                Ordering::Greater => index += 1,
                Ordering::Equal => {
                    let previous = std::mem::replace(&mut node.items[index], item);
                    return Ok(Some(previous.value));
                }
            }
            node.ensure_loaded(index, store.as_ref(), ctx).await?;
        }
        let child = node.mutable_child(index, ctx)?;
        insert_node(child, item, max_items, store, ctx).await
    })
}

/// Load child `index` and report whether it can spare an item.
async fn child_can_spare(
    node: &mut Node,
    index: usize,
    min_items: usize,
    store: &dyn ChunkStore,
    ctx: &WriteContext,
) -> Result<bool> {
    node.ensure_loaded(index, store, ctx).await?;
    Ok(node.child(index)?.items.len() > min_items)
}

fn remove_node<'a>(
    node: &'a mut Node,
    removal: Removal<'a>,
    min_items: usize,
    store: &'a Arc<dyn ChunkStore>,
    ctx: &'a WriteContext,
) -> BoxFuture<'a, Result<Option<Item>>> {
    Box::pin(async move {
        node.dirty = true;
        let (index, found) = match removal {
            Removal::Max => {
                if node.children.is_empty() {
                    return Ok(node.items.pop());
                }
                (node.items.len(), false)
            }
            Removal::Min => {
                if node.children.is_empty() {
                    if node.items.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(node.items.remove(0)));
                }
                (0, false)
            }
            Removal::Key(key) => {
                let (index, found) = node.find(key);
                if node.children.is_empty() {
                    if found {
                        return Ok(Some(node.items.remove(index)));
                    }
                    return Ok(None);
                }
                (index, found)
            }
        };
        // Make sure the child we are about to enter can lose an item.
        node.ensure_loaded(index, store.as_ref(), ctx).await?;
        if node.child(index)?.items.len() <= min_items {
            return grow_child_and_remove(node, index, removal, min_items, store, ctx).await;
        }
        if found {
            // The hit is in this internal node: swap in its in-order
            // predecessor pulled from the left subtree.
            let child = node.mutable_child(index, ctx)?;
            let predecessor = remove_node(child, Removal::Max, min_items, store, ctx)
                .await?
                .ok_or_else(|| anyhow::anyhow!("non-minimal child yielded no predecessor"))?;
            let removed = std::mem::replace(&mut node.items[index], predecessor);
            return Ok(Some(removed));
        }
        let child = node.mutable_child(index, ctx)?;
        remove_node(child, removal, min_items, store, ctx).await
    })
}

/// Grow child `index` to above the minimum by stealing from a sibling or
/// merging, then retry the removal at this node.
fn grow_child_and_remove<'a>(
    node: &'a mut Node,
    mut index: usize,
    removal: Removal<'a>,
    min_items: usize,
    store: &'a Arc<dyn ChunkStore>,
    ctx: &'a WriteContext,
) -> BoxFuture<'a, Result<Option<Item>>> {
    Box::pin(async move {
        if index > 0 && child_can_spare(node, index - 1, min_items, store.as_ref(), ctx).await? {
            // Steal from the left sibling through the separator.
            node.ensure_loaded(index, store.as_ref(), ctx).await?;
            let (stolen_item, stolen_child) = {
                let left = node.mutable_child(index - 1, ctx)?;
                left.dirty = true;
                let item = left
                    .items
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("spare sibling was empty"))?;
                (item, left.children.pop())
            };
            let separator = std::mem::replace(&mut node.items[index - 1], stolen_item);
            let child = node.mutable_child(index, ctx)?;
            child.dirty = true;
            child.items.insert(0, separator);
            if let Some(stolen) = stolen_child {
                child.children.insert(0, stolen);
            }
        } else if index < node.items.len()
            && child_can_spare(node, index + 1, min_items, store.as_ref(), ctx).await?
        {
            // Steal from the right sibling through the separator.
            node.ensure_loaded(index, store.as_ref(), ctx).await?;
            let (stolen_item, stolen_child) = {
                let right = node.mutable_child(index + 1, ctx)?;
                right.dirty = true;
                let item = right.items.remove(0);
                let child = if right.children.is_empty() {
                    None
                } else {
                    Some(right.children.remove(0))
                };
                (item, child)
            };
            let separator = std::mem::replace(&mut node.items[index], stolen_item);
            let child = node.mutable_child(index, ctx)?;
            child.dirty = true;
            child.items.push(separator);
            if let Some(stolen) = stolen_child {
                child.children.push(stolen);
            }
        } else {
            // Merge with the right sibling, or with the left at the end.
            if index >= node.items.len() {
                index -= 1;
            }
            node.ensure_loaded(index, store.as_ref(), ctx).await?;
            node.ensure_loaded(index + 1, store.as_ref(), ctx).await?;
            let separator = node.items.remove(index);
            let merged = node.children.remove(index + 1);
            let Child::Loaded(merged) = merged else {
                return Err(anyhow::anyhow!("merge sibling not loaded"));
            };
            let mut merged = Arc::try_unwrap(merged).unwrap_or_else(|shared| (*shared).clone());
            let child = node.mutable_child(index, ctx)?;
            child.dirty = true;
            child.items.push(separator);
            child.items.append(&mut merged.items);
            child.children.append(&mut merged.children);
            ctx.free_node(merged);
        }
        remove_node(node, removal, min_items, store, ctx).await
    })
}

#[allow(clippy::too_many_arguments)]
fn iterate_node<'a, F>(
    node: &'a mut Node,
    start: Option<&'a IndexKey>,
    stop: Option<&'a IndexKey>,
    include_start: bool,
    direction: Direction,
    mut hit: bool,
    visitor: &'a mut F,
    store: &'a Arc<dyn ChunkStore>,
    ctx: &'a WriteContext,
) -> BoxFuture<'a, Result<(bool, bool)>>
where
    F: FnMut(&IndexKey, &ChunkHash) -> ControlFlow<()> + Send,
{
    Box::pin(async move {
        let has_children = !node.children.is_empty();
        match direction {
            Direction::Ascending => {
                for index in 0..node.items.len() {
                    if let Some(start) = start {
                        if node.items[index].key < *start {
                            continue;
                        }
                    }
                    if has_children {
                        node.ensure_loaded(index, store.as_ref(), ctx).await?;
                        let child = node.mutable_child(index, ctx)?;
                        let (new_hit, keep_going) = iterate_node(
                            child,
                            start,
                            stop,
                            include_start,
                            direction,
                            hit,
                            visitor,
                            store,
                            ctx,
                        )
                        .await?;
                        hit = new_hit;
                        if !keep_going {
                            return Ok((hit, false));
                        }
                    }
                    if !include_start && !hit {
                        if let Some(start) = start {
                            if node.items[index].key <= *start {
                                hit = true;
                                continue;
                            }
                        }
                    }
                    hit = true;
                    if let Some(stop) = stop {
                        if node.items[index].key >= *stop {
                            return Ok((hit, false));
                        }
                    }
                    let item = &node.items[index];
                    if visitor(&item.key, &item.value).is_break() {
                        return Ok((hit, false));
                    }
                }
                if has_children {
                    let last = node.children.len() - 1;
                    node.ensure_loaded(last, store.as_ref(), ctx).await?;
                    let child = node.mutable_child(last, ctx)?;
                    let (new_hit, keep_going) = iterate_node(
                        child,
                        start,
                        stop,
                        include_start,
                        direction,
                        hit,
                        visitor,
                        store,
                        ctx,
                    )
                    .await?;
                    hit = new_hit;
                    if !keep_going {
                        return Ok((hit, false));
                    }
                }
            }
            Direction::Descending => {
                for index in (0..node.items.len()).rev() {
                    if let Some(start) = start {
                        if node.items[index].key >= *start
                            && (!include_start || hit || node.items[index].key > *start)
                        {
                            continue;
                        }
                    }
                    if has_children {
                        node.ensure_loaded(index + 1, store.as_ref(), ctx).await?;
                        let child = node.mutable_child(index + 1, ctx)?;
                        let (new_hit, keep_going) = iterate_node(
                            child,
                            start,
                            stop,
                            include_start,
                            direction,
                            hit,
                            visitor,
                            store,
                            ctx,
                        )
                        .await?;
                        hit = new_hit;
                        if !keep_going {
                            return Ok((hit, false));
                        }
                    }
                    if let Some(stop) = stop {
                        if node.items[index].key <= *stop {
                            return Ok((hit, false));
                        }
                    }
                    hit = true;
                    let item = &node.items[index];
                    if visitor(&item.key, &item.value).is_break() {
                        return Ok((hit, false));
                    }
                }
                if has_children {
                    node.ensure_loaded(0, store.as_ref(), ctx).await?;
                    let child = node.mutable_child(0, ctx)?;
                    let (new_hit, keep_going) = iterate_node(
                        child,
                        start,
                        stop,
                        include_start,
                        direction,
                        hit,
                        visitor,
                        store,
                        ctx,
                    )
                    .await?;
                    hit = new_hit;
                    if !keep_going {
                        return Ok((hit, false));
                    }
                }
            }
        }
        Ok((hit, true))
    })
}

/// Post-order flush: dirty children serialize before their parent so the
/// parent can embed their fresh hashes.
fn flush_node<'a>(
    node: &'a mut Node,
    store: &'a Arc<dyn ChunkStore>,
) -> BoxFuture<'a, Result<ChunkHash>> {
    Box::pin(async move {
        for child in node.children.iter_mut() {
            if let Child::Loaded(child) = child {
                if child.dirty {
                    let child = Arc::make_mut(child);
                    flush_node(child, store).await?;
                }
            }
        }
        let bytes = node.serialize()?;
        let hash = store.store(&bytes).await?;
        tracing::debug!(node = %hash, items = node.items.len(), "flushed node");
        node.hash = Some(hash);
        node.dirty = false;
        Ok(hash)
    })
}

#[allow(clippy::too_many_arguments)]
fn verify_node<'a>(
    node: &'a mut Node,
    is_root: bool,
    min_items: usize,
    max_items: usize,
    lower: Option<IndexKey>,
    upper: Option<IndexKey>,
    store: &'a Arc<dyn ChunkStore>,
    ctx: &'a WriteContext,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        anyhow::ensure!(
            node.items.len() <= max_items,
            "node holds {} items, maximum is {max_items}",
            node.items.len()
        );
        if !is_root {
            anyhow::ensure!(
                node.items.len() >= min_items,
                "node holds {} items, minimum is {min_items}",
                node.items.len()
            );
        }
        if !node.children.is_empty() {
            anyhow::ensure!(
                node.children.len() == node.items.len() + 1,
                "{} children for {} items",
                node.children.len(),
                node.items.len()
            );
        }
        let mut previous = lower;
        for item in &node.items {
            if let Some(previous) = &previous {
                anyhow::ensure!(*previous < item.key, "keys not strictly increasing");
            }
            previous = Some(item.key);
        }
        if let (Some(upper), Some(last)) = (&upper, node.items.last()) {
            anyhow::ensure!(last.key < *upper, "key exceeds separator bound");
        }
        for index in 0..node.children.len() {
            node.ensure_loaded(index, store.as_ref(), ctx).await?;
            let lower = if index == 0 {
                lower
            } else {
                Some(node.items[index - 1].key)
            };
            let upper = if index == node.items.len() {
                upper
            } else {
                Some(node.items[index].key)
            };
            let child = node.mutable_child(index, ctx)?;
            verify_node(child, false, min_items, max_items, lower, upper, store, ctx).await?;
        }
        Ok(())
    })
}
