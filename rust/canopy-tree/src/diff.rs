use canopy_log::Log;

use crate::{
    CanopyTreeError, Entry, Snapshot,
    iter::{Frame, seek},
    source::{BlockAccess, load_node},
};

/// Bounds for a diff walk. Only ascending traversal is supported;
/// when both a strict and an inclusive bound are set on the same
/// side, the strict one wins.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Consider only keys strictly greater than this one.
    pub gt: Option<Vec<u8>>,
    /// Consider only keys greater than or equal to this one.
    pub gte: Option<Vec<u8>>,
    /// Consider only keys strictly less than this one.
    pub lt: Option<Vec<u8>>,
    /// Consider only keys less than or equal to this one.
    pub lte: Option<Vec<u8>>,
    /// Yield at most this many differences.
    pub limit: Option<usize>,
}

impl DiffOptions {
    /// Consider the whole key space.
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

    /// Yield at most `limit` differences.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn seek_bound(&self) -> Option<(&[u8], bool)> {
        if let Some(key) = &self.gt {
            Some((key, false))
        } else {
            self.gte.as_deref().map(|key| (key, true))
        }
    }

    fn past_upper(&self, key: &[u8]) -> bool {
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
        false
    }
}

/// One difference between two versions: the entry as of the left
/// version and the entry as of the right version. A side is `None`
/// when the key has no entry there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    /// The entry as of the left version, if any.
    pub left: Option<Entry>,
    /// The entry as of the right version, if any.
    pub right: Option<Entry>,
}

/// What a diff cursor currently points at: a key slot, or a stored
/// child pointer that has not been entered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    Key { seq: u64 },
    Child { seq: u64, offset: u64 },
}

impl Item {
    fn identical(self, other: Item) -> bool {
        match (self, other) {
            (Item::Key { seq: a }, Item::Key { seq: b }) => a == b,
            (Item::Child { seq: a, offset: x }, Item::Child { seq: b, offset: y }) => {
                a == b && x == y
            }
            _ => false,
        }
    }
}

struct DiffCursor<L>
where
    L: Log,
{
    snapshot: Snapshot<L>,
    stack: Vec<Frame>,
}

impl<L> DiffCursor<L>
where
    L: Log,
{
    fn new(snapshot: Snapshot<L>) -> Self {
        Self {
            snapshot,
            stack: Vec::new(),
        }
    }

    async fn open(&mut self, bound: Option<(&[u8], bool)>) -> Result<(), CanopyTreeError> {
        if let Some(root) = self.snapshot.root_pointer() {
            let mut stack = Vec::new();
            seek(&self.snapshot, root, bound, false, &mut stack).await?;
            self.stack = stack;
        }
        Ok(())
    }

    /// The item under the cursor, normalizing past exhausted frames
    /// and leaf child slots. `None` once the walk is complete.
    fn peek(&mut self) -> Result<Option<Item>, CanopyTreeError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let span = 2 * frame.node.keys.len() as i64;
            if frame.position < 0 || frame.position > span {
                self.stack.pop();
                continue;
            }
            if frame.position % 2 == 0 {
                if frame.node.is_leaf() {
                    frame.position += 1;
                    continue;
                }
                let child_index = (frame.position / 2) as usize;
                let (seq, offset) = frame.node.stored_child(child_index)?;
                return Ok(Some(Item::Child { seq, offset }));
            }
            let key_index = ((frame.position - 1) / 2) as usize;
            return Ok(Some(Item::Key {
                seq: frame.node.keys[key_index].seq,
            }));
        }
    }

    /// Step past the current item without entering it.
    fn skip(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.position += 1;
        }
    }

    /// Enter the child the cursor points at, leaving the parent
    /// positioned just past it.
    async fn descend(&mut self, seq: u64, offset: u64) -> Result<(), CanopyTreeError> {
        if let Some(frame) = self.stack.last_mut() {
            frame.position += 1;
        }
        let node = load_node(&self.snapshot, seq, offset).await?;
        self.stack.push(Frame::enter(seq, offset, node, false));
        Ok(())
    }

    /// The upper key bound governing the current item: the key itself
    /// for a key slot, or the separator above a child pointer,
    /// borrowed from the nearest ancestor when the child is rightmost
    /// in its node. `None` means unbounded.
    async fn effective_key(&self) -> Result<Option<Vec<u8>>, CanopyTreeError> {
        for frame in self.stack.iter().rev() {
            let candidate = if frame.position % 2 == 1 {
                (frame.position - 1) / 2
            } else {
                frame.position / 2
            } as usize;
            if candidate < frame.node.keys.len() {
                let seq = frame.node.keys[candidate].seq;
                let block = self.snapshot.block(seq).await?;
                return Ok(Some(block.key.clone()));
            }
        }
        Ok(None)
    }

    async fn entry(&self, seq: u64) -> Result<Entry, CanopyTreeError> {
        Ok(self.snapshot.block(seq).await?.entry())
    }
}

/// Compare `None`-is-infinity upper bounds.
fn compare_bounds(left: &Option<Vec<u8>>, right: &Option<Vec<u8>>) -> std::cmp::Ordering {
    match (left, right) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// A cursor over the differences between two [`Snapshot`]s, in
/// ascending key order.
///
/// Both versions are walked in lockstep. Whenever the two cursors
/// stand on the same persisted key or subtree, it is skipped without
/// being read, so the cost of a diff is proportional to the amount of
/// change rather than to the size of the tree. Keys rewritten with
/// identical bytes still differ by block and are reported.
pub struct DiffIterator<L>
where
    L: Log,
{
    left: DiffCursor<L>,
    right: DiffCursor<L>,
    options: DiffOptions,
    opened: bool,
    done: bool,
    remaining: Option<usize>,
}

impl<L> DiffIterator<L>
where
    L: Log,
{
    pub(crate) fn new(left: Snapshot<L>, right: Snapshot<L>, options: DiffOptions) -> Self {
        let remaining = options.limit;
        let done = left.version() == right.version();
        Self {
            left: DiffCursor::new(left),
            right: DiffCursor::new(right),
            options,
            opened: false,
            done,
            remaining,
        }
    }

    /// The next difference, or `None` once both versions agree on the
    /// rest of the range.
    pub async fn next(&mut self) -> Result<Option<DiffEntry>, CanopyTreeError> {
        if self.done {
            return Ok(None);
        }
        if !self.opened {
            self.opened = true;
            let bound = self.options.seek_bound().map(|(key, inclusive)| (key.to_vec(), inclusive));
            let bound_ref = bound.as_ref().map(|(key, inclusive)| (key.as_slice(), *inclusive));
            self.left.open(bound_ref).await?;
            self.right.open(bound_ref).await?;
        }
        if self.remaining == Some(0) {
            self.done = true;
            return Ok(None);
        }
        loop {
            let left_item = self.left.peek()?;
            let right_item = self.right.peek()?;
            match (left_item, right_item) {
                (None, None) => {
                    self.done = true;
                    return Ok(None);
                }
                (Some(item), None) => match item {
                    Item::Child { seq, offset } => self.left.descend(seq, offset).await?,
                    Item::Key { seq } => {
                        let entry = self.left.entry(seq).await?;
                        self.left.skip();
                        return self.emit(Some(entry), None);
                    }
                },
                (None, Some(item)) => match item {
                    Item::Child { seq, offset } => self.right.descend(seq, offset).await?,
                    Item::Key { seq } => {
                        let entry = self.right.entry(seq).await?;
                        self.right.skip();
                        return self.emit(None, Some(entry));
                    }
                },
                (Some(left_item), Some(right_item)) => {
                    if left_item.identical(right_item) {
                        self.left.skip();
                        self.right.skip();
                        continue;
                    }
                    let left_bound = self.left.effective_key().await?;
                    let right_bound = self.right.effective_key().await?;
                    let order = compare_bounds(&left_bound, &right_bound);
                    match (left_item, right_item) {
                        (Item::Key { seq: left_seq }, Item::Key { seq: right_seq }) => match order {
                            std::cmp::Ordering::Less => {
                                let entry = self.left.entry(left_seq).await?;
                                self.left.skip();
                                return self.emit(Some(entry), None);
                            }
                            std::cmp::Ordering::Greater => {
                                let entry = self.right.entry(right_seq).await?;
                                self.right.skip();
                                return self.emit(None, Some(entry));
                            }
                            std::cmp::Ordering::Equal => {
                                let left_entry = self.left.entry(left_seq).await?;
                                let right_entry = self.right.entry(right_seq).await?;
                                self.left.skip();
                                self.right.skip();
                                return self.emit(Some(left_entry), Some(right_entry));
                            }
                        },
                        (
                            Item::Child {
                                seq: left_seq,
                                offset: left_offset,
                            },
                            Item::Child {
                                seq: right_seq,
                                offset: right_offset,
                            },
                        ) => match order {
                            // Enter the subtree reaching further: it
                            // may expose a child shared verbatim with
                            // the other side.
                            std::cmp::Ordering::Less => {
                                self.right.descend(right_seq, right_offset).await?
                            }
                            std::cmp::Ordering::Greater => {
                                self.left.descend(left_seq, left_offset).await?
                            }
                            std::cmp::Ordering::Equal => {
                                self.left.descend(left_seq, left_offset).await?;
                                self.right.descend(right_seq, right_offset).await?;
                            }
                        },
                        (Item::Child { seq, offset }, Item::Key { .. }) => {
                            self.left.descend(seq, offset).await?;
                        }
                        (Item::Key { .. }, Item::Child { seq, offset }) => {
                            self.right.descend(seq, offset).await?;
                        }
                    }
                }
            }
        }
    }

    fn emit(
        &mut self,
        left: Option<Entry>,
        right: Option<Entry>,
    ) -> Result<Option<DiffEntry>, CanopyTreeError> {
        let key = left
            .as_ref()
            .or(right.as_ref())
            .map(|entry| entry.key.clone())
            .unwrap_or_default();
        if self.options.past_upper(&key) {
            self.done = true;
            return Ok(None);
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        Ok(Some(DiffEntry { left, right }))
    }
}
