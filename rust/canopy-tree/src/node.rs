use crate::{CanopyTreeError, source::BlockAccess};

/// Maximum number of children an index node may carry. Nodes hold at
/// most `MAX_CHILDREN - 1` keys and split when they would exceed it.
pub(crate) const MAX_CHILDREN: usize = 8;

/// A reference to a key by the sequence number of the block that
/// wrote it. The bytes are fetched lazily on first comparison and
/// cached for the lifetime of the in-memory node.
#[derive(Debug, Clone)]
pub(crate) struct KeyRef {
    pub seq: u64,
    cache: Option<Vec<u8>>,
}

impl KeyRef {
    pub fn new(seq: u64) -> Self {
        Self { seq, cache: None }
    }

    pub fn with_bytes(seq: u64, bytes: Vec<u8>) -> Self {
        Self {
            seq,
            cache: Some(bytes),
        }
    }

    /// The key's bytes, resolving them from `source` if they have not
    /// been seen yet.
    pub async fn bytes<S>(&mut self, source: &S) -> Result<&[u8], CanopyTreeError>
    where
        S: BlockAccess + ?Sized,
    {
        if self.cache.is_none() {
            let block = source.block(self.seq).await?;
            self.cache = Some(block.key.clone());
        }
        match self.cache.as_deref() {
            Some(bytes) => Ok(bytes),
            None => Err(CanopyTreeError::UnexpectedTreeShape(
                "Key reference failed to resolve".into(),
            )),
        }
    }
}

/// A child pointer: either a node persisted in some block, or a node
/// rewritten by the mutation currently in progress.
#[derive(Debug, Clone)]
pub(crate) enum Child {
    Stored { seq: u64, offset: u64 },
    Dirty(Box<TreeNode>),
}

/// An in-memory tree node. Leaves have no children; internal nodes
/// have exactly one more child than keys. Keys are kept in strictly
/// increasing byte order.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub keys: Vec<KeyRef>,
    pub children: Vec<Child>,
}

impl TreeNode {
    pub fn leaf(keys: Vec<KeyRef>) -> Self {
        Self {
            keys,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Binary search for `key`. `Ok(index)` when the key is present,
    /// `Err(index)` with the child (or insertion) slot otherwise.
    pub async fn find<S>(
        &mut self,
        key: &[u8],
        source: &S,
    ) -> Result<Result<usize, usize>, CanopyTreeError>
    where
        S: BlockAccess + ?Sized,
    {
        let mut low = 0;
        let mut high = self.keys.len();
        while low < high {
            let middle = (low + high) / 2;
            let probe = self.keys[middle].bytes(source).await?;
            match probe.cmp(key) {
                std::cmp::Ordering::Less => low = middle + 1,
                std::cmp::Ordering::Greater => high = middle,
                std::cmp::Ordering::Equal => return Ok(Ok(middle)),
            }
        }
        Ok(Err(low))
    }

    /// The stored location of the child at `index`. Descents only
    /// ever traverse persisted children.
    pub fn stored_child(&self, index: usize) -> Result<(u64, u64), CanopyTreeError> {
        match self.children.get(index) {
            Some(Child::Stored { seq, offset }) => Ok((*seq, *offset)),
            Some(Child::Dirty(_)) => Err(CanopyTreeError::UnexpectedTreeShape(
                "Descended into a child that is still being rewritten".into(),
            )),
            None => Err(CanopyTreeError::UnexpectedTreeShape(format!(
                "Child index {index} out of range"
            ))),
        }
    }

    /// Load the child node at `index` from `source`.
    pub async fn child<S>(&self, index: usize, source: &S) -> Result<TreeNode, CanopyTreeError>
    where
        S: BlockAccess + ?Sized,
    {
        let (seq, offset) = self.stored_child(index)?;
        source.block(seq).await?.node(offset)
    }

    /// Split a node that has reached [`MAX_CHILDREN`] keys. `self`
    /// keeps the lower half; the median key and the upper half are
    /// returned for insertion into the parent.
    pub fn split(&mut self) -> (KeyRef, TreeNode) {
        let middle = self.keys.len() / 2;
        let median = self.keys.remove(middle);
        let keys = self.keys.split_off(middle);
        let children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(middle + 1)
        };
        (median, TreeNode { keys, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seqs: &[u64]) -> Vec<KeyRef> {
        seqs.iter().map(|&seq| KeyRef::new(seq)).collect()
    }

    #[test]
    fn it_splits_a_full_leaf_around_the_median() {
        let mut node = TreeNode::leaf(keys(&[1, 2, 3, 4, 5, 6, 7, 8]));

        let (median, right) = node.split();

        assert_eq!(median.seq, 5);
        assert_eq!(
            node.keys.iter().map(|key| key.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            right.keys.iter().map(|key| key.seq).collect::<Vec<_>>(),
            vec![6, 7, 8]
        );
    }

    #[test]
    fn it_splits_internal_children_alongside_keys() {
        let children = (0..9)
            .map(|offset| Child::Stored { seq: 1, offset })
            .collect();
        let mut node = TreeNode {
            keys: keys(&[1, 2, 3, 4, 5, 6, 7, 8]),
            children,
        };

        let (_, right) = node.split();

        assert_eq!(node.children.len(), 5);
        assert_eq!(right.children.len(), 4);
    }
}
