use std::sync::Arc;

use async_trait::async_trait;
use sieve_cache::SieveCache;
use tokio::sync::{Mutex, watch};

use crate::{CanopyLogError, Log, LogSignal};

/// A [`CachedLog`] acts as a transparent proxy to an inner [`Log`]
/// implementation. Reads are cached in a [`SieveCache`] and may be
/// retrieved from there on future reads.
///
/// Records are immutable once written, so cached entries never go
/// stale through appends. A truncate invalidates the whole cache,
/// since sequence numbers beyond the cut may later be reused by new
/// records.
#[derive(Clone)]
pub struct CachedLog<L>
where
    L: Log,
{
    inner: L,
    cache: Arc<Mutex<SieveCache<u64, Vec<u8>>>>,
    capacity: usize,
}

impl<L> CachedLog<L>
where
    L: Log,
{
    /// Wrap the provided [`Log`] so that reads are fronted by a cache
    /// holding up to `capacity` records.
    pub fn new(inner: L, capacity: usize) -> Result<Self, CanopyLogError> {
        Ok(Self {
            inner,
            cache: Arc::new(Mutex::new(SieveCache::new(capacity).map_err(|error| {
                CanopyLogError::Io(format!("Could not initialize cache: {error}"))
            })?)),
            capacity,
        })
    }
}

#[async_trait]
impl<L> Log for CachedLog<L>
where
    L: Log,
{
    async fn ready(&self) -> Result<(), CanopyLogError> {
        self.inner.ready().await
    }

    async fn append(&self, record: Vec<u8>) -> Result<u64, CanopyLogError> {
        let seq = self.inner.append(record.clone()).await?;
        self.cache.lock().await.insert(seq, record);
        Ok(seq)
    }

    async fn get(&self, seq: u64) -> Result<Vec<u8>, CanopyLogError> {
        let mut cache = self.cache.lock().await;
        if let Some(record) = cache.get(&seq) {
            return Ok(record.clone());
        }
        let record = self.inner.get(seq).await?;
        cache.insert(seq, record.clone());
        Ok(record)
    }

    async fn length(&self) -> Result<u64, CanopyLogError> {
        self.inner.length().await
    }

    async fn truncate(&self, length: u64) -> Result<(), CanopyLogError> {
        self.inner.truncate(length).await?;

        let mut cache = self.cache.lock().await;
        *cache = SieveCache::new(self.capacity)
            .map_err(|error| CanopyLogError::Io(format!("Could not reset cache: {error}")))?;

        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<LogSignal> {
        self.inner.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLog;
    use anyhow::Result;

    #[tokio::test]
    async fn it_serves_reads_through_the_cache() -> Result<()> {
        let log = CachedLog::new(MemoryLog::new(), 16)?;

        let seq = log.append(vec![1, 2, 3]).await?;
        assert_eq!(log.get(seq).await?, vec![1, 2, 3]);
        assert_eq!(log.get(seq).await?, vec![1, 2, 3]);

        Ok(())
    }

    #[tokio::test]
    async fn it_invalidates_the_cache_on_truncate() -> Result<()> {
        let log = CachedLog::new(MemoryLog::new(), 16)?;

        log.append(vec![1]).await?;
        let seq = log.append(vec![2]).await?;
        assert_eq!(log.get(seq).await?, vec![2]);

        log.truncate(1).await?;
        assert!(matches!(
            log.get(seq).await,
            Err(CanopyLogError::BlockNotAvailable(_))
        ));

        // A fresh record under the same sequence number must not be
        // shadowed by the pruned one.
        let reused = log.append(vec![3]).await?;
        assert_eq!(reused, seq);
        assert_eq!(log.get(reused).await?, vec![3]);

        Ok(())
    }
}
