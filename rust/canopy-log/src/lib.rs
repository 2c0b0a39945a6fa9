#![warn(missing_docs)]

//! This crate defines the append-only log contract consumed by
//! `canopy-tree`, along with an in-memory implementation and a
//! read-through caching wrapper.
//!
//! A [`Log`] is a durable sequence of opaque binary records addressed
//! by a monotonically increasing sequence number. Records are never
//! rewritten; the only destructive operation is [`Log::truncate`],
//! which discards a tail of the sequence. Every append and truncate
//! is broadcast as a [`LogSignal`] so that observers can tail the log
//! without polling.
//!
//! ```rust
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use canopy_log::{Log, MemoryLog};
//!
//! let log = MemoryLog::new();
//! log.ready().await?;
//!
//! let seq = log.append(vec![1, 2, 3]).await?;
//! assert_eq!(log.get(seq).await?, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::*;

mod log;
pub use log::*;

mod memory;
pub use memory::*;

mod cache;
pub use cache::*;
