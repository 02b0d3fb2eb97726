//! Frame cache
//!
//! Raw frame payloads are cached by [`CacheKey`] so seeking back to a frame
//! that was already streamed never touches the network. The cache is an
//! optimization only: [`CacheHandle`] turns every fault into a logged miss,
//! and writes are fire-and-forget.
//!
//! Stores:
//! - [`DiskFrameCache`]: one file per frame, survives restarts
//! - [`MemoryFrameCache`]: bounded in-process LRU
//! - [`TieredFrameCache`]: memory in front of disk
//! - [`NoopFrameCache`]: caching disabled

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::types::CacheKey;

mod disk;
mod memory;
mod tiered;

pub use disk::DiskFrameCache;
pub use memory::MemoryFrameCache;
pub use tiered::TieredFrameCache;

/// Key-value store for raw frame payloads
///
/// Implementations must tolerate concurrent `get`/`put` from independent
/// sessions. A miss is `Ok(None)`, never an error.
#[async_trait::async_trait]
pub trait FrameCache: Send + Sync + 'static {
    /// Look up a frame
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Store a frame
    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<()>;
}

/// Cache that stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFrameCache;

#[async_trait::async_trait]
impl FrameCache for NoopFrameCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn put(&self, _key: &CacheKey, _data: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Best-effort access to a shared frame cache
///
/// Reads are bounded by a timeout and degrade to a miss; writes run on a
/// detached task and only ever log their failures.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<dyn FrameCache>,
    read_timeout: Duration,
}

impl CacheHandle {
    /// Wrap a cache with the given read timeout
    pub fn new(cache: Arc<dyn FrameCache>, read_timeout: Duration) -> Self {
        Self { inner: cache, read_timeout }
    }

    /// Handle whose lookups always miss
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopFrameCache), Duration::from_millis(1))
    }

    /// Look up a frame; faults and slow reads count as misses
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        match tokio::time::timeout(self.read_timeout, self.inner.get(key)).await {
            Ok(Ok(Some(data))) if !data.is_empty() => {
                debug!(key = %key, bytes = data.len(), "Frame cache hit");
                Some(data)
            }
            Ok(Ok(_)) => {
                debug!(key = %key, "Frame cache miss");
                None
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Frame cache read failed, treating as miss");
                None
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout = ?self.read_timeout,
                    "Frame cache read timed out, treating as miss"
                );
                None
            }
        }
    }

    /// Store a frame without waiting for the write
    ///
    /// Must be called from within a tokio runtime.
    pub fn put(&self, key: CacheKey, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.put(&key, data).await {
                Ok(()) => trace!(key = %key, "Frame cached"),
                Err(e) => warn!(key = %key, error = %e, "Frame cache write failed"),
            }
        });
    }

    /// Store a frame and wait for the write to finish
    pub async fn put_and_wait(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.put(key, data).await
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").field("read_timeout", &self.read_timeout).finish()
    }
}
