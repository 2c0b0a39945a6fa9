use canopy_log::Log;

use crate::{
    CanopyTreeError, Entry, Snapshot,
    node::TreeNode,
    source::{BlockAccess, load_node},
};

/// Bounds and traversal options for a range walk.
///
/// When both a strict and an inclusive bound are set on the same
/// side, the strict one wins.
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    /// Yield only keys strictly greater than this one.
    pub gt: Option<Vec<u8>>,
    /// Yield only keys greater than or equal to this one.
    pub gte: Option<Vec<u8>>,
    /// Yield only keys strictly less than this one.
    pub lt: Option<Vec<u8>>,
    /// Yield only keys less than or equal to this one.
    pub lte: Option<Vec<u8>>,
    /// Walk in descending key order.
    pub reverse: bool,
    /// Yield at most this many entries.
    pub limit: Option<usize>,
}

impl RangeOptions {
    /// An unbounded, ascending walk over all entries.
    pub fn all() -> Self {
        Self::default()
    }

    /// Keys strictly greater than `key`.
    pub fn gt(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.gt = Some(key.into());
        self
    }

    /// Keys greater than or equal to `key`.
    pub fn gte(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.gte = Some(key.into());
        self
    }

    /// Keys strictly less than `key`.
    pub fn lt(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.lt = Some(key.into());
        self
    }

    /// Keys less than or equal to `key`.
    pub fn lte(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.lte = Some(key.into());
        self
    }

    /// Walk in descending key order.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Yield at most `limit` entries.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn seek_bound(&self, reverse: bool) -> Option<(&[u8], bool)> {
        if reverse {
            if let Some(key) = &self.lt {
                Some((key, false))
            } else {
                self.lte.as_deref().map(|key| (key, true))
            }
        } else if let Some(key) = &self.gt {
            Some((key, false))
        } else {
            self.gte.as_deref().map(|key| (key, true))
        }
    }

    fn past_terminal(&self, key: &[u8]) -> bool {
        if self.reverse {
            if let Some(bound) = &self.gt {
                if key <= bound.as_slice() {
                    return true;
                }
            }
            if let Some(bound) = &self.gte {
                if key < bound.as_slice() {
                    return true;
                }
            }
        } else {
            if let Some(bound) = &self.lt {
                if key >= bound.as_slice() {
                    return true;
                }
            }
            if let Some(bound) = &self.lte {
                if key > bound.as_slice() {
                    return true;
                }
            }
        }
        false
    }
}

/// One suspended stack frame of a range walk, exportable so the walk
/// can be resumed later, possibly in another process.
///
/// `position` interleaves child and key slots of the node at
/// (`seq`, `offset`): even positions `2i` address child `i`, odd
/// positions `2i + 1` address key `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointFrame {
    /// Sequence number of the block holding the node.
    pub seq: u64,
    /// Node offset within that block.
    pub offset: u64,
    /// Interleaved cursor position within the node.
    pub position: i64,
}

pub(crate) struct Frame {
    pub seq: u64,
    pub offset: u64,
    pub node: TreeNode,
    pub position: i64,
}

impl Frame {
    pub fn enter(seq: u64, offset: u64, node: TreeNode, reverse: bool) -> Self {
        let position = if reverse {
            2 * node.keys.len() as i64
        } else {
            0
        };
        Self {
            seq,
            offset,
            node,
            position,
        }
    }
}

/// Position a fresh stack on the first in-bound slot for `bound`.
/// Along the way, each frame is left pointing just past the child
/// being descended into, so the walk continues correctly once the
/// descent is exhausted.
pub(crate) async fn seek<L>(
    snapshot: &Snapshot<L>,
    root: (u64, u64),
    bound: Option<(&[u8], bool)>,
    reverse: bool,
    stack: &mut Vec<Frame>,
) -> Result<(), CanopyTreeError>
where
    L: Log,
{
    let (mut seq, mut offset) = root;
    let mut node = load_node(snapshot, seq, offset).await?;
    let Some((bound, inclusive)) = bound else {
        stack.push(Frame::enter(seq, offset, node, reverse));
        return Ok(());
    };
    loop {
        match node.find(bound, snapshot).await? {
            Ok(index) => {
                let index = index as i64;
                let position = match (reverse, inclusive) {
                    (false, true) => 2 * index + 1,
                    (false, false) => 2 * index + 2,
                    (true, true) => 2 * index + 1,
                    (true, false) => 2 * index,
                };
                stack.push(Frame {
                    seq,
                    offset,
                    node,
                    position,
                });
                return Ok(());
            }
            Err(index) => {
                let index = index as i64;
                let position = if reverse { 2 * index - 1 } else { 2 * index + 1 };
                if node.is_leaf() {
                    stack.push(Frame {
                        seq,
                        offset,
                        node,
                        position,
                    });
                    return Ok(());
                }
                let (child_seq, child_offset) = node.stored_child(index as usize)?;
                stack.push(Frame {
                    seq,
                    offset,
                    node,
                    position,
                });
                seq = child_seq;
                offset = child_offset;
                node = load_node(snapshot, seq, offset).await?;
            }
        }
    }
}

enum Step {
    Descend { seq: u64, offset: u64 },
    Yield { key_seq: u64 },
}

/// A cursor over the entries of one [`Snapshot`], in key order.
///
/// The walk is lazy: nothing is read until the first
/// [`next`](RangeIterator::next) call, which seeks to the range's
/// first entry without touching subtrees outside it. At any point the
/// traversal state can be exported with
/// [`checkpoint`](RangeIterator::checkpoint) and later rebuilt with
/// [`Snapshot::resume`].
pub struct RangeIterator<L>
where
    L: Log,
{
    snapshot: Snapshot<L>,
    options: RangeOptions,
    stack: Vec<Frame>,
    seeked: bool,
    done: bool,
    remaining: Option<usize>,
}

impl<L> RangeIterator<L>
where
    L: Log,
{
    pub(crate) fn new(snapshot: Snapshot<L>, options: RangeOptions) -> Self {
        let remaining = options.limit;
        Self {
            snapshot,
            options,
            stack: Vec::new(),
            seeked: false,
            done: false,
            remaining,
        }
    }

    pub(crate) async fn resume(
        snapshot: Snapshot<L>,
        options: RangeOptions,
        checkpoint: &[CheckpointFrame],
    ) -> Result<Self, CanopyTreeError> {
        let mut stack = Vec::with_capacity(checkpoint.len());
        for frame in checkpoint {
            let node = load_node(&snapshot, frame.seq, frame.offset).await?;
            stack.push(Frame {
                seq: frame.seq,
                offset: frame.offset,
                node,
                position: frame.position,
            });
        }
        let remaining = options.limit;
        Ok(Self {
            snapshot,
            options,
            done: stack.is_empty(),
            stack,
            seeked: true,
            remaining,
        })
    }

    /// Export the traversal state. Only meaningful once iteration has
    /// started; an exhausted iterator exports an empty checkpoint.
    pub fn checkpoint(&self) -> Vec<CheckpointFrame> {
        self.stack
            .iter()
            .map(|frame| CheckpointFrame {
                seq: frame.seq,
                offset: frame.offset,
                position: frame.position,
            })
            .collect()
    }

    /// The next entry within bounds, or `None` once the range is
    /// exhausted.
    pub async fn next(&mut self) -> Result<Option<Entry>, CanopyTreeError> {
        if self.done {
            return Ok(None);
        }
        if !self.seeked {
            self.seeked = true;
            if let Some(root) = self.snapshot.root_pointer() {
                let bound = self.options.seek_bound(self.options.reverse);
                let mut stack = Vec::new();
                seek(
                    &self.snapshot,
                    root,
                    bound,
                    self.options.reverse,
                    &mut stack,
                )
                .await?;
                self.stack = stack;
            } else {
                self.done = true;
                return Ok(None);
            }
        }
        if self.remaining == Some(0) {
            self.done = true;
            return Ok(None);
        }
        let direction: i64 = if self.options.reverse { -1 } else { 1 };
        loop {
            let step = {
                let Some(frame) = self.stack.last_mut() else {
                    self.done = true;
                    return Ok(None);
                };
                let span = 2 * frame.node.keys.len() as i64;
                if frame.position < 0 || frame.position > span {
                    self.stack.pop();
                    continue;
                }
                if frame.position % 2 == 0 {
                    if frame.node.is_leaf() {
                        frame.position += direction;
                        continue;
                    }
                    let child_index = (frame.position / 2) as usize;
                    let (seq, offset) = frame.node.stored_child(child_index)?;
                    frame.position += direction;
                    Step::Descend { seq, offset }
                } else {
                    let key_index = ((frame.position - 1) / 2) as usize;
                    let key_seq = frame.node.keys[key_index].seq;
                    frame.position += direction;
                    Step::Yield { key_seq }
                }
            };
            match step {
                Step::Descend { seq, offset } => {
                    let node = load_node(&self.snapshot, seq, offset).await?;
                    self.stack
                        .push(Frame::enter(seq, offset, node, self.options.reverse));
                }
                Step::Yield { key_seq } => {
                    let block = BlockAccess::block(&self.snapshot, key_seq).await?;
                    let entry = block.entry();
                    if self.options.past_terminal(&entry.key) {
                        self.done = true;
                        return Ok(None);
                    }
                    if let Some(remaining) = &mut self.remaining {
                        *remaining -= 1;
                    }
                    return Ok(Some(entry));
                }
            }
        }
    }
}
