use std::sync::Arc;

use async_trait::async_trait;

use crate::{CanopyTreeError, Entry, block::Block, node::TreeNode};

/// The seam through which tree walks resolve blocks. Snapshots serve
/// committed blocks (through their pin and cache); batches overlay
/// their own pending blocks on top of the committed state.
#[async_trait]
pub(crate) trait BlockAccess: Send + Sync {
    async fn block(&self, seq: u64) -> Result<Arc<Block>, CanopyTreeError>;
}

/// Load the node at `offset` within the block at `seq`.
pub(crate) async fn load_node<S>(
    source: &S,
    seq: u64,
    offset: u64,
) -> Result<TreeNode, CanopyTreeError>
where
    S: BlockAccess + ?Sized,
{
    source.block(seq).await?.node(offset)
}

/// Point lookup of `key` starting from `root`, which is `None` for an
/// empty tree.
pub(crate) async fn lookup<S>(
    source: &S,
    root: Option<(u64, u64)>,
    key: &[u8],
) -> Result<Option<Entry>, CanopyTreeError>
where
    S: BlockAccess + ?Sized,
{
    let Some((seq, offset)) = root else {
        return Ok(None);
    };
    let mut node = load_node(source, seq, offset).await?;
    loop {
        match node.find(key, source).await? {
            Ok(index) => {
                let block = source.block(node.keys[index].seq).await?;
                return Ok(Some(block.entry()));
            }
            Err(index) => {
                if node.is_leaf() {
                    return Ok(None);
                }
                node = node.child(index, source).await?;
            }
        }
    }
}
