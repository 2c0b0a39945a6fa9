use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug)]
pub enum CanopyLogError {
    /// A record could not be retrieved: it was never written, it was
    /// pruned by a truncate, or it is not locally resident
    #[error("Block not available at sequence {0}")]
    BlockNotAvailable(u64),

    /// A truncate was requested beyond the current length of the log
    #[error("Log operation out of bounds: {0}")]
    OutOfBounds(String),

    /// The underlying storage substrate failed
    #[error("Log I/O error: {0}")]
    Io(String),
}
