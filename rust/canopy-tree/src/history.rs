use canopy_log::Log;
use futures_core::Stream;

use crate::{CanopyTreeError, Entry, Tree, block::Block};

/// Options for a walk over the write history of the tree.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// First version to yield; defaults to 1, the oldest write.
    pub start: Option<u64>,
    /// Last version to yield; defaults to the version current when
    /// the stream is first polled. Ignored by live streams.
    pub end: Option<u64>,
    /// Yield newest first. Incompatible with `live`.
    pub reverse: bool,
    /// Keep the stream open, yielding writes as they are committed.
    pub live: bool,
}

impl HistoryOptions {
    /// The whole history, oldest first.
    pub fn all() -> Self {
        Self::default()
    }

    /// Start at `version`.
    pub fn start(mut self, version: u64) -> Self {
        self.start = Some(version);
        self
    }

    /// End at `version`.
    pub fn end(mut self, version: u64) -> Self {
        self.end = Some(version);
        self
    }

    /// Yield newest first.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Follow the log, never completing on your own account.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }
}

impl<L> Tree<L>
where
    L: Log,
{
    /// Stream the write history, one [`Entry`] per committed version.
    /// Deletions appear with a `value` of `None`.
    ///
    /// A live stream keeps waiting for further commits instead of
    /// completing; live cannot be combined with reverse.
    pub fn history(
        &self,
        options: HistoryOptions,
    ) -> impl Stream<Item = Result<Entry, CanopyTreeError>> + '_ {
        async_stream::try_stream! {
            if options.live && options.reverse {
                Err(CanopyTreeError::InvalidOptions(
                    "A live history stream cannot run in reverse".into(),
                ))?;
            }
            let current = self.version().await?;
            let start = options.start.unwrap_or(1).max(1);
            if options.reverse {
                let end = options.end.unwrap_or(current).min(current);
                let mut version = end;
                while version >= start {
                    let bytes = self.log().get(version).await?;
                    yield Block::decode(version, &bytes)?.entry();
                    version -= 1;
                }
            } else if options.live {
                let mut signal = self.log().subscribe();
                let mut version = start;
                loop {
                    let tip = self.version().await?;
                    while version <= tip {
                        let bytes = self.log().get(version).await?;
                        yield Block::decode(version, &bytes)?.entry();
                        version += 1;
                    }
                    if signal.changed().await.is_err() {
                        break;
                    }
                }
            } else {
                let end = options.end.unwrap_or(current).min(current);
                let mut version = start;
                while version <= end {
                    let bytes = self.log().get(version).await?;
                    yield Block::decode(version, &bytes)?.entry();
                    version += 1;
                }
            }
        }
    }
}
