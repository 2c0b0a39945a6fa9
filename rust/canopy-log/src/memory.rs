use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{CanopyLogError, Log, LogSignal};

/// An in-memory [`Log`] backed by a record vector.
///
/// Used by tests and as the reference implementation of the log
/// contract. All clones share the same underlying records and the
/// same signal channel.
#[derive(Clone)]
pub struct MemoryLog {
    records: Arc<RwLock<Vec<Vec<u8>>>>,
    signal: Arc<watch::Sender<LogSignal>>,
}

impl MemoryLog {
    /// Create a new, empty [`MemoryLog`].
    pub fn new() -> Self {
        let (signal, _) = watch::channel(LogSignal::default());
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            signal: Arc::new(signal),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn ready(&self) -> Result<(), CanopyLogError> {
        Ok(())
    }

    async fn append(&self, record: Vec<u8>) -> Result<u64, CanopyLogError> {
        let mut records = self.records.write();
        let seq = records.len() as u64;
        records.push(record);
        let length = records.len() as u64;
        drop(records);

        self.signal.send_modify(|state| state.length = length);
        Ok(seq)
    }

    async fn get(&self, seq: u64) -> Result<Vec<u8>, CanopyLogError> {
        let records = self.records.read();
        records
            .get(seq as usize)
            .cloned()
            .ok_or(CanopyLogError::BlockNotAvailable(seq))
    }

    async fn length(&self) -> Result<u64, CanopyLogError> {
        Ok(self.records.read().len() as u64)
    }

    async fn truncate(&self, length: u64) -> Result<(), CanopyLogError> {
        let mut records = self.records.write();
        if length > records.len() as u64 {
            return Err(CanopyLogError::OutOfBounds(format!(
                "Cannot truncate to {length}: log has {} records",
                records.len()
            )));
        }
        records.truncate(length as usize);
        drop(records);

        tracing::debug!(length, "log truncated");

        self.signal.send_modify(|state| {
            state.length = length;
            state.truncations += 1;
        });
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<LogSignal> {
        self.signal.subscribe()
    }
}
