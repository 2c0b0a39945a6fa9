#![warn(missing_docs)]

//! An ordered key/value index persisted inside an append-only log.
//!
//! Every write appends one block: the key, the value (or a deletion
//! marker), and the handful of index nodes rewritten on the write's
//! account. The block at the tip of the log always holds the current
//! root, so the log doubles as the full version history of the tree:
//! any past version can be checked out, iterated, diffed against any
//! other, and watched for changes.
//!
//! ```
//! # use canopy_log::MemoryLog;
//! # use canopy_tree::{RangeOptions, Tree};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let tree = Tree::open(MemoryLog::new()).await?;
//!
//! tree.put(b"a", b"1").await?;
//! tree.put(b"b", b"2").await?;
//!
//! let entry = tree.get(b"a").await?;
//! assert_eq!(entry.and_then(|entry| entry.value), Some(b"1".to_vec()));
//!
//! let snapshot = tree.snapshot().await?;
//! let mut range = snapshot.iter(RangeOptions::all().gte(*b"b"));
//! assert!(range.next().await?.is_some());
//! # Ok(())
//! # }
//! ```

mod batch;
mod block;
mod diff;
mod entry;
mod error;
mod history;
mod iter;
mod node;
mod source;
mod tree;
mod watch;

pub use batch::Batch;
pub use diff::{DiffEntry, DiffIterator, DiffOptions};
pub use entry::Entry;
pub use error::CanopyTreeError;
pub use history::HistoryOptions;
pub use iter::{CheckpointFrame, RangeIterator, RangeOptions};
pub use tree::{Snapshot, Tree};
pub use watch::{KeyWatcher, RangeWatcher, WatchCloser};
