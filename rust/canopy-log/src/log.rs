use async_trait::async_trait;
use tokio::sync::watch;

use crate::CanopyLogError;

/// The state broadcast to subscribers whenever a [`Log`] changes.
///
/// `length` is the current record count. `truncations` counts how
/// many times the log has been truncated; a subscriber that caches
/// state derived from the log must re-evaluate whenever it observes
/// the counter advancing, even if `length` has since grown back past
/// its previous observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogSignal {
    /// Current record count of the log.
    pub length: u64,
    /// Number of truncations performed over the lifetime of the log.
    pub truncations: u64,
}

/// A [`Log`] is an append-only sequence of opaque binary records
/// addressed by 0-based sequence number.
///
/// Implementations are cheaply clonable handles onto shared state.
/// Appends are serialized internally; records are immutable once
/// written, so concurrent readers need no coordination with the
/// writer beyond the implementation's own interior locking.
#[async_trait]
pub trait Log: Clone + Send + Sync + 'static {
    /// Resolves once the initial state of the log is known.
    async fn ready(&self) -> Result<(), CanopyLogError>;

    /// Durably append one record, returning the sequence number it
    /// was stored at. The new length is observable immediately after
    /// this call returns.
    async fn append(&self, record: Vec<u8>) -> Result<u64, CanopyLogError>;

    /// Retrieve the record at `seq`.
    ///
    /// Fails with [`CanopyLogError::BlockNotAvailable`] when the
    /// record cannot be produced: absent, pruned, or (for remote
    /// logs with waiting disabled) not yet fetched from a peer.
    async fn get(&self, seq: u64) -> Result<Vec<u8>, CanopyLogError>;

    /// The current record count.
    async fn length(&self) -> Result<u64, CanopyLogError>;

    /// Discard all records at sequence `length` and beyond, so that
    /// the log's length becomes exactly `length`. Subscribers are
    /// notified.
    async fn truncate(&self, length: u64) -> Result<(), CanopyLogError>;

    /// Subscribe to append/truncate notifications.
    ///
    /// The receiver is seeded with the current [`LogSignal`]; callers
    /// should mark it seen before waiting if they only care about
    /// subsequent changes.
    fn subscribe(&self) -> watch::Receiver<LogSignal>;
}
