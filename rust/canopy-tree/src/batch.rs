use std::sync::Arc;

use async_trait::async_trait;
use canopy_log::Log;

use crate::{
    CanopyTreeError, Entry, Tree,
    block::{Block, IndexChild, IndexNode},
    node::{Child, KeyRef, MAX_CHILDREN, TreeNode},
    source::{BlockAccess, load_node, lookup},
};

/// An atomic group of writes staged on top of a committed version.
///
/// Every write appends a provisional block to an in-memory overlay;
/// reads through the batch observe the overlay before the committed
/// tree, so a batch always sees its own writes. Nothing reaches the
/// log until [`Batch::flush`], which appends all pending blocks
/// contiguously. If another batch committed in the meantime, the
/// staged writes are replayed against the new tip before appending,
/// so the last flush wins per key.
///
/// Versions covered by pending blocks are reserved against
/// [`Tree::checkout`] until the batch flushes or is dropped.
pub struct Batch<L>
where
    L: Log,
{
    tree: Tree<L>,
    base_version: u64,
    overlay: Vec<Block>,
    reservation: Option<u64>,
    on_fetch: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl<L> Batch<L>
where
    L: Log,
{
    pub(crate) async fn create(tree: Tree<L>) -> Result<Self, CanopyTreeError> {
        let base_version = tree.version().await?;
        Ok(Self {
            tree,
            base_version,
            overlay: Vec::new(),
            reservation: None,
            on_fetch: None,
        })
    }

    /// The version this batch would produce if flushed now.
    pub fn version(&self) -> u64 {
        self.base_version + self.overlay.len() as u64
    }

    /// Number of staged, unflushed writes.
    pub fn pending(&self) -> usize {
        self.overlay.len()
    }

    /// Install a hook invoked with the sequence number of every
    /// committed block fetched from the log on behalf of this batch.
    pub fn set_fetch_hook<F>(&mut self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_fetch = Some(Arc::new(hook));
    }

    fn next_seq(&self) -> u64 {
        self.base_version + self.overlay.len() as u64 + 1
    }

    fn root_pointer(&self) -> Option<(u64, u64)> {
        if self.overlay.is_empty() {
            (self.base_version >= 1).then_some((self.base_version, 0))
        } else {
            Some((self.version(), 0))
        }
    }

    /// Look up `key`, observing this batch's own pending writes.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Entry>, CanopyTreeError> {
        lookup(self, self.root_pointer(), key).await
    }

    /// Stage an insert or overwrite of `key`.
    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), CanopyTreeError> {
        let seq = self.next_seq();
        let root = self.insert(key, seq).await?;
        self.push_block(key.to_vec(), Some(value.to_vec()), root)
    }

    /// Conditionally stage an insert or overwrite of `key`. The swap
    /// predicate sees the existing entry (if any) and the proposed
    /// one; a `false` verdict discards the write without staging
    /// anything, and `Ok(false)` is returned.
    pub async fn put_with<C>(
        &mut self,
        key: &[u8],
        value: &[u8],
        cas: C,
    ) -> Result<bool, CanopyTreeError>
    where
        C: Fn(Option<&Entry>, &Entry) -> bool + Send + Sync,
    {
        let existing = self.get(key).await?;
        let proposed = Entry::new(self.next_seq(), key.to_vec(), Some(value.to_vec()));
        if !cas(existing.as_ref(), &proposed) {
            tracing::trace!("conditional put discarded");
            return Ok(false);
        }
        let root = self.insert(key, proposed.seq).await?;
        self.push_block(key.to_vec(), Some(value.to_vec()), root)?;
        Ok(true)
    }

    /// Stage a deletion of `key`, returning whether it was present.
    /// Deleting an absent key stages nothing.
    pub async fn del(&mut self, key: &[u8]) -> Result<bool, CanopyTreeError> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        let root = self.remove(key).await?;
        self.push_block(key.to_vec(), None, root)?;
        Ok(true)
    }

    /// Conditionally stage a deletion of `key`.
    pub async fn del_with<C>(&mut self, key: &[u8], cas: C) -> Result<bool, CanopyTreeError>
    where
        C: Fn(Option<&Entry>, &Entry) -> bool + Send + Sync,
    {
        let Some(existing) = self.get(key).await? else {
            return Ok(false);
        };
        let proposed = Entry::new(self.next_seq(), key.to_vec(), None);
        if !cas(Some(&existing), &proposed) {
            tracing::trace!("conditional delete discarded");
            return Ok(false);
        }
        let root = self.remove(key).await?;
        self.push_block(key.to_vec(), None, root)?;
        Ok(true)
    }

    /// Append all pending blocks to the log.
    ///
    /// The flush lock serializes concurrent flushes. When another
    /// batch committed since this one was created, the staged writes
    /// are first replayed against the newly committed root, so keys
    /// this batch never touched keep whatever the interleaving flush
    /// did to them. Per key, the last flush wins.
    pub async fn flush(&mut self) -> Result<(), CanopyTreeError> {
        if self.overlay.is_empty() {
            self.release();
            return Ok(());
        }
        let lock = self.tree.flush_lock();
        let _guard = lock.lock().await;

        let committed = self.tree.version().await?;
        if committed != self.base_version {
            self.rebase(committed).await?;
        }

        let count = self.overlay.len();
        for block in self.overlay.drain(..) {
            self.tree.log().append(block.encode()?).await?;
        }
        self.base_version = self.tree.version().await?;
        self.release();

        tracing::debug!(count, version = self.base_version, "batch flushed");
        Ok(())
    }

    /// Copy-on-write insert of `key` (recorded by the block at `seq`)
    /// over the current root, returning the replacement root.
    async fn insert(&self, key: &[u8], seq: u64) -> Result<TreeNode, CanopyTreeError> {
        let Some((root_seq, root_offset)) = self.root_pointer() else {
            return Ok(TreeNode::leaf(vec![KeyRef::with_bytes(seq, key.to_vec())]));
        };
        let mut node = load_node(self, root_seq, root_offset).await?;
        let mut path: Vec<(TreeNode, usize)> = Vec::new();
        loop {
            match node.find(key, self).await? {
                Ok(index) => {
                    // Overwrite in place: the key slot now points at
                    // the new block. No shape change, no splits.
                    node.keys[index] = KeyRef::with_bytes(seq, key.to_vec());
                    let mut current = node;
                    while let Some((mut parent, child_index)) = path.pop() {
                        parent.children[child_index] = Child::Dirty(Box::new(current));
                        current = parent;
                    }
                    return Ok(current);
                }
                Err(index) => {
                    if node.is_leaf() {
                        node.keys.insert(index, KeyRef::with_bytes(seq, key.to_vec()));
                        return Ok(ascend_with_splits(node, path));
                    }
                    let child = node.child(index, self).await?;
                    path.push((node, index));
                    node = child;
                }
            }
        }
    }

    /// Copy-on-write removal of `key`, returning the replacement
    /// root. The caller has already verified presence.
    async fn remove(&self, key: &[u8]) -> Result<TreeNode, CanopyTreeError> {
        let Some((root_seq, root_offset)) = self.root_pointer() else {
            return Err(CanopyTreeError::UnexpectedTreeShape(
                "Removal from an empty tree".into(),
            ));
        };
        let mut node = load_node(self, root_seq, root_offset).await?;
        let mut path: Vec<(TreeNode, usize)> = Vec::new();
        loop {
            match node.find(key, self).await? {
                Ok(index) => {
                    if node.is_leaf() {
                        node.keys.remove(index);
                        return self.ascend_after_removal(node, path).await;
                    }
                    // The key sits in an internal node: replace it
                    // with its in-order predecessor, pulled from the
                    // nearest leaf, then repair from that leaf up.
                    let (replacement, leaf, inner_path, child_index) =
                        self.take_adjacent_key(&node, index).await?;
                    node.keys[index] = replacement;
                    path.push((node, child_index));
                    path.extend(inner_path);
                    return self.ascend_after_removal(leaf, path).await;
                }
                Err(index) => {
                    if node.is_leaf() {
                        return Err(CanopyTreeError::UnexpectedTreeShape(
                            "Removal descended past a missing key".into(),
                        ));
                    }
                    let child = node.child(index, self).await?;
                    path.push((node, index));
                    node = child;
                }
            }
        }
    }

    /// Pull the in-order predecessor of the key at `index` out of the
    /// subtree to its left (or, if that subtree has run dry, the
    /// successor out of the subtree to its right). Returns the pulled
    /// key, the leaf it was removed from, the path from the subtree
    /// root down to that leaf, and the child index descended into.
    async fn take_adjacent_key(
        &self,
        node: &TreeNode,
        index: usize,
    ) -> Result<(KeyRef, TreeNode, Vec<(TreeNode, usize)>, usize), CanopyTreeError> {
        if let Some((key, leaf, inner_path)) = self.take_edge_key(node, index, true).await? {
            return Ok((key, leaf, inner_path, index));
        }
        if let Some((key, leaf, inner_path)) = self.take_edge_key(node, index + 1, false).await? {
            return Ok((key, leaf, inner_path, index + 1));
        }
        Err(CanopyTreeError::UnexpectedTreeShape(
            "No adjacent key available for an occupied node".into(),
        ))
    }

    async fn take_edge_key(
        &self,
        node: &TreeNode,
        child_index: usize,
        rightmost: bool,
    ) -> Result<Option<(KeyRef, TreeNode, Vec<(TreeNode, usize)>)>, CanopyTreeError> {
        if child_index >= node.children.len() {
            return Ok(None);
        }
        let mut current = node.child(child_index, self).await?;
        let mut inner_path: Vec<(TreeNode, usize)> = Vec::new();
        while !current.is_leaf() {
            let next_index = if rightmost {
                current.children.len() - 1
            } else {
                0
            };
            let next = current.child(next_index, self).await?;
            inner_path.push((current, next_index));
            current = next;
        }
        let pulled = if current.keys.is_empty() {
            None
        } else if rightmost {
            current.keys.pop()
        } else {
            Some(current.keys.remove(0))
        };
        match pulled {
            Some(key) => Ok(Some((key, current, inner_path))),
            None => Ok(None),
        }
    }

    /// Reattach a rewritten leaf to its ancestors after a removal,
    /// retiring emptied leaves and collapsing keyless single-child
    /// nodes along the way.
    async fn ascend_after_removal(
        &self,
        node: TreeNode,
        mut path: Vec<(TreeNode, usize)>,
    ) -> Result<TreeNode, CanopyTreeError> {
        let mut current = node;
        loop {
            let Some((mut parent, index)) = path.pop() else {
                // A keyless root with a single child hands the root
                // role down, shrinking the tree by one level.
                if current.keys.is_empty() && current.children.len() == 1 {
                    return match current.children.pop() {
                        Some(Child::Dirty(child)) => Ok(*child),
                        Some(Child::Stored { seq, offset }) => load_node(self, seq, offset).await,
                        None => Ok(current),
                    };
                }
                return Ok(current);
            };
            if current.keys.is_empty() && current.is_leaf() && !parent.keys.is_empty() {
                parent = self.fold_empty_leaf(parent, index).await?;
            } else if current.keys.is_empty() && current.children.len() == 1 {
                if let Some(only) = current.children.pop() {
                    parent.children[index] = only;
                }
            } else {
                parent.children[index] = Child::Dirty(Box::new(current));
            }
            current = parent;
        }
    }

    /// Retire the emptied leaf at `index` of `parent`, moving the
    /// separator key it leaves behind into an adjacent leaf sibling.
    async fn fold_empty_leaf(
        &self,
        mut parent: TreeNode,
        index: usize,
    ) -> Result<TreeNode, CanopyTreeError> {
        let sibling_index = if index > 0 { index - 1 } else { index + 1 };
        let Some(sibling_child) = parent.children.get(sibling_index) else {
            parent.children[index] = Child::Dirty(Box::new(TreeNode::leaf(Vec::new())));
            return Ok(parent);
        };
        let mut sibling = match sibling_child {
            Child::Stored { seq, offset } => load_node(self, *seq, *offset).await?,
            Child::Dirty(node) => (**node).clone(),
        };
        if !sibling.is_leaf() {
            // Sibling depths diverged after earlier collapses; keep
            // the empty leaf rather than rebalance across levels.
            parent.children[index] = Child::Dirty(Box::new(TreeNode::leaf(Vec::new())));
            return Ok(parent);
        }
        let separator_index = sibling_index.min(index);
        let separator = parent.keys.remove(separator_index);
        parent.children.remove(index);
        if sibling_index < index {
            sibling.keys.push(separator);
        } else {
            sibling.keys.insert(0, separator);
        }
        let slot = separator_index;
        if sibling.keys.len() >= MAX_CHILDREN {
            let (median, right) = sibling.split();
            parent.children[slot] = Child::Dirty(Box::new(sibling));
            parent.keys.insert(slot, median);
            parent
                .children
                .insert(slot + 1, Child::Dirty(Box::new(right)));
        } else {
            parent.children[slot] = Child::Dirty(Box::new(sibling));
        }
        Ok(parent)
    }

    fn push_block(
        &mut self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        root: TreeNode,
    ) -> Result<(), CanopyTreeError> {
        let seq = self.next_seq();
        let mut index = Vec::new();
        flatten(root, seq, &mut index);
        if self.reservation.is_none() {
            let id = self
                .tree
                .reservations()
                .lock()
                .claim(self.base_version + 1);
            self.reservation = Some(id);
        }
        self.overlay.push(Block {
            seq,
            key,
            value,
            index,
        });
        Ok(())
    }

    /// Rebase pending writes onto the tip at `committed`. The pending
    /// index arrays were built from a root that is no longer current,
    /// so they cannot simply be shifted; instead the staged key/value
    /// list is replayed against the freshly committed root, rebuilding
    /// every block.
    async fn rebase(&mut self, committed: u64) -> Result<(), CanopyTreeError> {
        let staged: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .overlay
            .drain(..)
            .map(|block| (block.key, block.value))
            .collect();
        self.base_version = committed;
        tracing::debug!(
            count = staged.len(),
            version = committed,
            "batch rebased onto a newer tip"
        );
        for (key, value) in staged {
            match value {
                Some(value) => self.put(&key, &value).await?,
                // A tombstone for a key the interleaving flush already
                // removed replays as a no-op.
                None => {
                    self.del(&key).await?;
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(id) = self.reservation.take() {
            self.tree.reservations().lock().release(id);
        }
    }
}

impl<L> Drop for Batch<L>
where
    L: Log,
{
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl<L> BlockAccess for Batch<L>
where
    L: Log,
{
    async fn block(&self, seq: u64) -> Result<Arc<Block>, CanopyTreeError> {
        if seq == 0 {
            return Err(CanopyTreeError::UnexpectedTreeShape(
                "Reference to the format header as a tree block".into(),
            ));
        }
        if seq > self.base_version {
            let slot = (seq - self.base_version - 1) as usize;
            return self
                .overlay
                .get(slot)
                .cloned()
                .map(Arc::new)
                .ok_or(CanopyTreeError::BlockNotAvailable(seq));
        }
        let bytes = self.tree.log().get(seq).await?;
        if let Some(hook) = &self.on_fetch {
            hook(seq);
        }
        Ok(Arc::new(Block::decode(seq, &bytes)?))
    }
}

/// Reattach a rewritten leaf to its ancestors after an insert,
/// splitting any node that reached [`MAX_CHILDREN`] keys around its
/// median. A split at the root grows the tree by one level.
fn ascend_with_splits(mut node: TreeNode, mut path: Vec<(TreeNode, usize)>) -> TreeNode {
    loop {
        if node.keys.len() >= MAX_CHILDREN {
            let (median, right) = node.split();
            match path.pop() {
                Some((mut parent, index)) => {
                    parent.children[index] = Child::Dirty(Box::new(node));
                    parent.keys.insert(index, median);
                    parent
                        .children
                        .insert(index + 1, Child::Dirty(Box::new(right)));
                    node = parent;
                }
                None => {
                    node = TreeNode {
                        keys: vec![median],
                        children: vec![Child::Dirty(Box::new(node)), Child::Dirty(Box::new(right))],
                    };
                }
            }
        } else {
            match path.pop() {
                Some((mut parent, index)) => {
                    parent.children[index] = Child::Dirty(Box::new(node));
                    node = parent;
                }
                None => return node,
            }
        }
    }
}

/// Serialize a rewritten subtree into a block's node list in
/// pre-order, so the replacement root always lands at offset 0.
/// References into the block being built use the sequence sentinel 0.
fn flatten(node: TreeNode, block_seq: u64, index: &mut Vec<IndexNode>) -> u64 {
    let slot = index.len() as u64;
    index.push(IndexNode {
        keys: Vec::new(),
        children: Vec::new(),
    });
    let keys = node
        .keys
        .iter()
        .map(|key| if key.seq == block_seq { 0 } else { key.seq })
        .collect();
    let mut children = Vec::with_capacity(node.children.len());
    for child in node.children {
        match child {
            Child::Stored { seq, offset } => children.push(IndexChild { seq, offset }),
            Child::Dirty(sub) => {
                let offset = flatten(*sub, block_seq, index);
                children.push(IndexChild { seq: 0, offset });
            }
        }
    }
    index[slot as usize] = IndexNode { keys, children };
    slot
}
