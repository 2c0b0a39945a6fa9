use canopy_log::CanopyLogError;
use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug)]
pub enum CanopyTreeError {
    /// A block referenced by the tree could not be retrieved from the
    /// log
    #[error("Block not available at sequence {0}")]
    BlockNotAvailable(u64),

    /// A pinned snapshot refers to blocks that have since been pruned
    /// by a truncate
    #[error("Snapshot at version {0} is no longer available")]
    SnapshotNotAvailable(u64),

    /// A checkout was requested for a version that is still pending
    /// inside an unflushed batch
    #[error("Cannot checkout version {0}: it is pending in an unflushed batch")]
    InvalidCheckout(u64),

    /// A log record could not be decoded as a tree block
    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    /// A decoded block described a tree shape that violates the
    /// format's structural invariants
    #[error("Unexpected tree shape: {0}")]
    UnexpectedTreeShape(String),

    /// Mutually exclusive or otherwise unusable options were supplied
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The underlying log failed
    #[error("Log error: {0}")]
    Log(CanopyLogError),
}

impl From<CanopyLogError> for CanopyTreeError {
    fn from(value: CanopyLogError) -> Self {
        match value {
            CanopyLogError::BlockNotAvailable(seq) => CanopyTreeError::BlockNotAvailable(seq),
            other => CanopyTreeError::Log(other),
        }
    }
}
