use std::sync::Arc;

use canopy_log::{Log, LogSignal};
use tokio::sync::watch;

use crate::{CanopyTreeError, DiffOptions, Entry, RangeOptions, Snapshot, Tree};

/// A handle through which a watcher can be shut down from elsewhere,
/// including while a [`next`](RangeWatcher::next) call is in flight.
#[derive(Clone)]
pub struct WatchCloser {
    sender: Arc<watch::Sender<bool>>,
}

impl WatchCloser {
    /// Shut the watcher down. Its pending and future `next` calls
    /// resolve to `None`.
    pub fn close(&self) {
        let _ = self.sender.send(true);
    }
}

/// Shared plumbing of both watcher kinds: the log signal to wait on,
/// the close flag, and truncation tracking.
struct WatchControl {
    signal: watch::Receiver<LogSignal>,
    closed: watch::Receiver<bool>,
    closer: Arc<watch::Sender<bool>>,
}

impl WatchControl {
    /// `signal` must be subscribed before the watcher's baseline is
    /// taken: a commit landing in between then shows up as a pending
    /// change, and `evaluate` filters it out if the baseline already
    /// includes it.
    fn new(signal: watch::Receiver<LogSignal>) -> Self {
        let (closer, closed) = watch::channel(false);
        Self {
            signal,
            closed,
            closer: Arc::new(closer),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closer(&self) -> WatchCloser {
        WatchCloser {
            sender: self.closer.clone(),
        }
    }

    /// Wait for the log to change. `None` when the watcher has been
    /// closed instead.
    async fn wait(&mut self) -> Option<LogSignal> {
        if self.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => None,
            changed = self.signal.changed() => {
                if changed.is_err() {
                    return None;
                }
                Some(*self.signal.borrow_and_update())
            }
        }
    }
}

/// Watches a key range for changes.
///
/// The watcher is pull-based: nothing is evaluated until
/// [`next`](RangeWatcher::next) is awaited, and any number of commits
/// between two `next` calls coalesce into a single delivery. Each
/// delivery is a `(current, previous)` pair of snapshots, where
/// `previous` is the snapshot delivered last time (or the state when
/// the watcher was created), so consumers can diff exactly what they
/// missed.
pub struct RangeWatcher<L>
where
    L: Log,
{
    tree: Tree<L>,
    range: RangeOptions,
    control: WatchControl,
    previous: Snapshot<L>,
    truncations_seen: u64,
}

impl<L> RangeWatcher<L>
where
    L: Log,
{
    pub(crate) async fn create(
        tree: Tree<L>,
        range: RangeOptions,
    ) -> Result<Self, CanopyTreeError> {
        let signal = tree.log().subscribe();
        let truncations_seen = signal.borrow().truncations;
        let previous = tree.snapshot().await?;
        Ok(Self {
            tree,
            range,
            control: WatchControl::new(signal),
            previous,
            truncations_seen,
        })
    }

    /// A handle that can close this watcher from another task.
    pub fn closer(&self) -> WatchCloser {
        self.control.closer()
    }

    /// Shut the watcher down.
    pub fn close(&self) {
        self.control.closer().close();
    }

    /// The next observed change within the range, as a `(current,
    /// previous)` snapshot pair. `None` once the watcher is closed.
    ///
    /// Commits that only touch keys outside the range are absorbed
    /// silently. A truncation is always delivered, even when the
    /// range's content ends up byte-identical afterwards.
    pub async fn next(&mut self) -> Option<Result<(Snapshot<L>, Snapshot<L>), CanopyTreeError>> {
        loop {
            let state = self.control.wait().await?;
            match self.evaluate(state).await {
                Ok(Some(delivery)) => {
                    if self.control.is_closed() {
                        return None;
                    }
                    return Some(Ok(delivery));
                }
                Ok(None) => continue,
                Err(error) => return Some(Err(error)),
            }
        }
    }

    async fn evaluate(
        &mut self,
        state: LogSignal,
    ) -> Result<Option<(Snapshot<L>, Snapshot<L>)>, CanopyTreeError> {
        let truncated = state.truncations != self.truncations_seen;
        self.truncations_seen = state.truncations;

        let current = self.tree.snapshot().await?;
        if current.version() == self.previous.version() && !truncated {
            return Ok(None);
        }
        let changed = truncated || {
            let options = DiffOptions {
                gt: self.range.gt.clone(),
                gte: self.range.gte.clone(),
                lt: self.range.lt.clone(),
                lte: self.range.lte.clone(),
                limit: Some(1),
            };
            let mut diff = self.previous.diff(&current, options);
            match diff.next().await {
                Ok(first) => first.is_some(),
                // The baseline fell off the log; surface the rollback
                // as a change rather than an error.
                Err(CanopyTreeError::SnapshotNotAvailable(_)) => true,
                Err(error) => return Err(error),
            }
        };
        if !changed {
            tracing::trace!(version = current.version(), "commit outside watched range");
            return Ok(None);
        }
        let previous = std::mem::replace(&mut self.previous, current.clone());
        Ok(Some((current, previous)))
    }
}

impl<L> Drop for RangeWatcher<L>
where
    L: Log,
{
    fn drop(&mut self) {
        self.close();
    }
}

/// Watches a single key for changes.
///
/// Pull-based and coalescing like [`RangeWatcher`]; each delivery is
/// a `(current, previous)` pair of entries, either side being `None`
/// when the key is absent at that point.
pub struct KeyWatcher<L>
where
    L: Log,
{
    tree: Tree<L>,
    key: Vec<u8>,
    control: WatchControl,
    previous: Option<Entry>,
    truncations_seen: u64,
}

impl<L> KeyWatcher<L>
where
    L: Log,
{
    pub(crate) async fn create(tree: Tree<L>, key: Vec<u8>) -> Result<Self, CanopyTreeError> {
        let signal = tree.log().subscribe();
        let truncations_seen = signal.borrow().truncations;
        let previous = tree.get(&key).await?;
        Ok(Self {
            tree,
            key,
            control: WatchControl::new(signal),
            previous,
            truncations_seen,
        })
    }

    /// A handle that can close this watcher from another task.
    pub fn closer(&self) -> WatchCloser {
        self.control.closer()
    }

    /// Shut the watcher down.
    pub fn close(&self) {
        self.control.closer().close();
    }

    /// The next observed change of the key, as a `(current,
    /// previous)` entry pair. `None` once the watcher is closed.
    pub async fn next(
        &mut self,
    ) -> Option<Result<(Option<Entry>, Option<Entry>), CanopyTreeError>> {
        loop {
            let state = self.control.wait().await?;
            match self.evaluate(state).await {
                Ok(Some(delivery)) => {
                    if self.control.is_closed() {
                        return None;
                    }
                    return Some(Ok(delivery));
                }
                Ok(None) => continue,
                Err(error) => return Some(Err(error)),
            }
        }
    }

    async fn evaluate(
        &mut self,
        state: LogSignal,
    ) -> Result<Option<(Option<Entry>, Option<Entry>)>, CanopyTreeError> {
        let truncated = state.truncations != self.truncations_seen;
        self.truncations_seen = state.truncations;

        let current = self.tree.get(&self.key).await?;
        let changed = truncated
            || match (&current, &self.previous) {
                (None, None) => false,
                (Some(now), Some(then)) => now.seq != then.seq,
                _ => true,
            };
        if !changed {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut self.previous, current.clone());
        Ok(Some((current, previous)))
    }
}

impl<L> Drop for KeyWatcher<L>
where
    L: Log,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<L> Tree<L>
where
    L: Log,
{
    /// Watch a key range for changes. See [`RangeWatcher`].
    pub async fn watch_range(
        &self,
        range: RangeOptions,
    ) -> Result<RangeWatcher<L>, CanopyTreeError> {
        RangeWatcher::create(self.clone(), range).await
    }

    /// Watch a single key for changes. See [`KeyWatcher`].
    pub async fn watch_key(&self, key: &[u8]) -> Result<KeyWatcher<L>, CanopyTreeError> {
        KeyWatcher::create(self.clone(), key.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use canopy_log::{Log, MemoryLog};

    use super::WatchControl;
    use crate::Tree;

    #[tokio::test]
    async fn it_observes_commits_between_subscription_and_first_wait() -> Result<()> {
        let tree = Tree::open(MemoryLog::new()).await?;
        let signal = tree.log().subscribe();

        // This commit lands after the subscription but before the
        // control is built, mirroring a write racing watcher creation.
        tree.put(b"key", b"racing").await?;

        let mut control = WatchControl::new(signal);
        let state = tokio::time::timeout(Duration::from_secs(1), control.wait())
            .await?
            .expect("the pending signal should be observed");
        assert_eq!(state.length, 2);

        Ok(())
    }
}
