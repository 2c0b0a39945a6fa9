use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use canopy_log::{CanopyLogError, Log};
use parking_lot::Mutex;

use crate::{
    Batch, CanopyTreeError, DiffIterator, DiffOptions, Entry, RangeIterator, RangeOptions,
    block::{Block, Header},
    iter::CheckpointFrame,
    source::{BlockAccess, lookup},
};

/// Versions reserved by in-flight batches. A batch claims the open
/// range starting just past its base version when it records its
/// first pending write, and releases the claim when it flushes or is
/// dropped.
#[derive(Default)]
pub(crate) struct Reservations {
    next_id: u64,
    active: Vec<(u64, u64)>,
}

impl Reservations {
    pub fn claim(&mut self, start: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.active.push((id, start));
        id
    }

    pub fn release(&mut self, id: u64) {
        self.active.retain(|(active_id, _)| *active_id != id);
    }

    pub fn covers(&self, version: u64) -> bool {
        self.active.iter().any(|(_, start)| version >= *start)
    }
}

/// An ordered key/value index persisted as blocks of an append-only
/// [`Log`].
///
/// Record 0 of the log is a format header; every record after it is a
/// [`Block`](crate::block) describing one write together with the
/// tree nodes rewritten on its account. The version of the tree is
/// the sequence number of the newest block, and every historical
/// version remains readable through [`Tree::checkout`].
///
/// A [`Tree`] is a cheaply clonable handle; clones share the same log
/// and coordination state.
pub struct Tree<L>
where
    L: Log,
{
    log: L,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    reservations: Arc<Mutex<Reservations>>,
}

impl<L> Clone for Tree<L>
where
    L: Log,
{
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            flush_lock: self.flush_lock.clone(),
            reservations: self.reservations.clone(),
        }
    }
}

impl<L> Tree<L>
where
    L: Log,
{
    /// Open a tree over the given log, writing the format header if
    /// the log is empty and verifying it otherwise.
    pub async fn open(log: L) -> Result<Self, CanopyTreeError> {
        log.ready().await?;
        if log.length().await? == 0 {
            log.append(Header::new().encode()?).await?;
        } else {
            Header::decode(&log.get(0).await?)?;
        }
        Ok(Self {
            log,
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            reservations: Arc::new(Mutex::new(Reservations::default())),
        })
    }

    pub(crate) fn log(&self) -> &L {
        &self.log
    }

    pub(crate) fn flush_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.flush_lock.clone()
    }

    pub(crate) fn reservations(&self) -> Arc<Mutex<Reservations>> {
        self.reservations.clone()
    }

    /// The current version: the number of writes committed so far.
    /// Version 0 is the empty tree.
    pub async fn version(&self) -> Result<u64, CanopyTreeError> {
        Ok(self.log.length().await?.saturating_sub(1))
    }

    /// A snapshot pinned to the current version.
    pub async fn snapshot(&self) -> Result<Snapshot<L>, CanopyTreeError> {
        let version = self.version().await?;
        Ok(Snapshot::new(self.clone(), version))
    }

    /// A snapshot pinned to an arbitrary historical `version`.
    ///
    /// Checking out a version that is pending inside an unflushed
    /// batch fails with [`CanopyTreeError::InvalidCheckout`]; a
    /// version past the tip with no batch to account for it fails
    /// with [`CanopyTreeError::BlockNotAvailable`].
    pub async fn checkout(&self, version: u64) -> Result<Snapshot<L>, CanopyTreeError> {
        let committed = self.version().await?;
        if version > committed {
            if self.reservations.lock().covers(version) {
                return Err(CanopyTreeError::InvalidCheckout(version));
            }
            return Err(CanopyTreeError::BlockNotAvailable(version));
        }
        Ok(Snapshot::new(self.clone(), version))
    }

    /// Start a [`Batch`] of writes over the current version.
    pub async fn batch(&self) -> Result<Batch<L>, CanopyTreeError> {
        Batch::create(self.clone()).await
    }

    /// Look up `key` at the current version.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Entry>, CanopyTreeError> {
        self.snapshot().await?.get(key).await
    }

    /// Insert or overwrite `key`, committing a single-write batch.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), CanopyTreeError> {
        let mut batch = self.batch().await?;
        batch.put(key, value).await?;
        batch.flush().await
    }

    /// Conditionally insert or overwrite `key`. The swap predicate
    /// sees the existing entry (if any) and the proposed one; when it
    /// returns `false` the write is discarded and `Ok(false)` is
    /// returned without appending anything.
    pub async fn put_with<C>(
        &self,
        key: &[u8],
        value: &[u8],
        cas: C,
    ) -> Result<bool, CanopyTreeError>
    where
        C: Fn(Option<&Entry>, &Entry) -> bool + Send + Sync,
    {
        let mut batch = self.batch().await?;
        let applied = batch.put_with(key, value, cas).await?;
        batch.flush().await?;
        Ok(applied)
    }

    /// Delete `key`, returning whether it was present. Deleting an
    /// absent key commits nothing.
    pub async fn del(&self, key: &[u8]) -> Result<bool, CanopyTreeError> {
        let mut batch = self.batch().await?;
        let removed = batch.del(key).await?;
        batch.flush().await?;
        Ok(removed)
    }

    /// Conditionally delete `key`. The swap predicate sees the
    /// existing entry and the proposed deletion.
    pub async fn del_with<C>(&self, key: &[u8], cas: C) -> Result<bool, CanopyTreeError>
    where
        C: Fn(Option<&Entry>, &Entry) -> bool + Send + Sync,
    {
        let mut batch = self.batch().await?;
        let removed = batch.del_with(key, cas).await?;
        batch.flush().await?;
        Ok(removed)
    }

    /// Differences between `other_version` and the current version,
    /// with entries as of `other_version` on the left.
    pub async fn diff(
        &self,
        other_version: u64,
        options: DiffOptions,
    ) -> Result<DiffIterator<L>, CanopyTreeError> {
        let left = self.checkout(other_version).await?;
        let right = self.snapshot().await?;
        Ok(left.diff(&right, options))
    }

    /// Roll the tree back so that `version` becomes the newest one.
    /// Snapshots pinned past the cut observe
    /// [`CanopyTreeError::SnapshotNotAvailable`] from then on.
    pub async fn truncate(&self, version: u64) -> Result<(), CanopyTreeError> {
        self.log.truncate(version + 1).await?;
        tracing::debug!(version, "tree rolled back");
        Ok(())
    }
}

/// A read-only view of the tree pinned to one version.
///
/// Blocks decoded on behalf of this snapshot are cached for its
/// lifetime, so repeated lookups and range walks over the same
/// subtrees stay cheap.
pub struct Snapshot<L>
where
    L: Log,
{
    tree: Tree<L>,
    version: u64,
    cache: Arc<Mutex<HashMap<u64, Arc<Block>>>>,
    on_fetch: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl<L> Clone for Snapshot<L>
where
    L: Log,
{
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            version: self.version,
            cache: self.cache.clone(),
            on_fetch: self.on_fetch.clone(),
        }
    }
}

impl<L> Snapshot<L>
where
    L: Log,
{
    pub(crate) fn new(tree: Tree<L>, version: u64) -> Self {
        Self {
            tree,
            version,
            cache: Arc::new(Mutex::new(HashMap::new())),
            on_fetch: None,
        }
    }

    /// The version this snapshot is pinned to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Install a hook invoked with the sequence number of every block
    /// fetched from the log on behalf of this snapshot. Cache hits do
    /// not trigger it.
    pub fn set_fetch_hook<F>(&mut self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_fetch = Some(Arc::new(hook));
    }

    pub(crate) fn root_pointer(&self) -> Option<(u64, u64)> {
        (self.version >= 1).then_some((self.version, 0))
    }

    /// Look up `key` as of this snapshot's version.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Entry>, CanopyTreeError> {
        lookup(self, self.root_pointer(), key).await
    }

    /// Iterate entries within `options`' bounds, in key order.
    pub fn iter(&self, options: RangeOptions) -> RangeIterator<L> {
        RangeIterator::new(self.clone(), options)
    }

    /// Rebuild a range iteration from a previously taken
    /// [checkpoint](RangeIterator::checkpoint), continuing exactly
    /// where the original left off.
    pub async fn resume(
        &self,
        options: RangeOptions,
        checkpoint: &[CheckpointFrame],
    ) -> Result<RangeIterator<L>, CanopyTreeError> {
        RangeIterator::resume(self.clone(), options, checkpoint).await
    }

    /// Entries within `options`' bounds as a stream.
    pub fn entries(
        &self,
        options: RangeOptions,
    ) -> impl futures_core::Stream<Item = Result<Entry, CanopyTreeError>> + '_ {
        async_stream::try_stream! {
            let mut iterator = self.iter(options);
            while let Some(entry) = iterator.next().await? {
                yield entry;
            }
        }
    }

    /// Differences between this snapshot (left) and `other` (right).
    pub fn diff(&self, other: &Snapshot<L>, options: DiffOptions) -> DiffIterator<L> {
        DiffIterator::new(self.clone(), other.clone(), options)
    }

    /// Release the snapshot. Snapshots hold no locks, so this is
    /// equivalent to dropping, but reads as intent at call sites.
    pub fn close(self) {}
}

#[async_trait]
impl<L> BlockAccess for Snapshot<L>
where
    L: Log,
{
    async fn block(&self, seq: u64) -> Result<Arc<Block>, CanopyTreeError> {
        if seq == 0 || seq > self.version {
            return Err(CanopyTreeError::UnexpectedTreeShape(format!(
                "Reference to sequence {seq} from a tree at version {}",
                self.version
            )));
        }
        if let Some(block) = self.cache.lock().get(&seq) {
            return Ok(block.clone());
        }
        match self.tree.log().get(seq).await {
            Ok(bytes) => {
                if let Some(hook) = &self.on_fetch {
                    hook(seq);
                }
                let block = Arc::new(Block::decode(seq, &bytes)?);
                self.cache.lock().insert(seq, block.clone());
                Ok(block)
            }
            Err(CanopyLogError::BlockNotAvailable(_)) => {
                // Distinguish a snapshot orphaned by a truncate from a
                // block that is merely absent.
                if self.tree.version().await? < self.version {
                    Err(CanopyTreeError::SnapshotNotAvailable(self.version))
                } else {
                    Err(CanopyTreeError::BlockNotAvailable(seq))
                }
            }
            Err(error) => Err(error.into()),
        }
    }
}
