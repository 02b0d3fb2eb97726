//! Memory-over-disk frame cache

use bytes::Bytes;
use std::sync::Arc;
use tracing::{trace, warn};

use super::{DiskFrameCache, FrameCache, MemoryFrameCache};
use crate::Result;
use crate::types::CacheKey;

/// Reads memory first, then disk; disk hits are promoted into memory
#[derive(Debug)]
pub struct TieredFrameCache {
    memory: Arc<MemoryFrameCache>,
    disk: Arc<DiskFrameCache>,
}

impl TieredFrameCache {
    pub fn new(memory: Arc<MemoryFrameCache>, disk: Arc<DiskFrameCache>) -> Self {
        Self { memory, disk }
    }

    pub fn memory(&self) -> &MemoryFrameCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskFrameCache {
        &self.disk
    }
}

#[async_trait::async_trait]
impl FrameCache for TieredFrameCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        if let Some(data) = self.memory.get(key).await? {
            trace!(key = %key, "Memory tier hit");
            return Ok(Some(data));
        }

        let found = self.disk.get(key).await?;
        if let Some(data) = &found {
            trace!(key = %key, "Disk tier hit, promoting");
            self.memory.put(key, data.clone()).await?;
        }
        Ok(found)
    }

    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        self.memory.put(key, data.clone()).await?;
        if let Err(e) = self.disk.put(key, data).await {
            warn!(key = %key, error = %e, "Disk tier write failed, frame kept in memory only");
            return Err(e);
        }
        Ok(())
    }
}
