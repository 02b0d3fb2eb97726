//! In-process LRU frame cache

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::trace;

use super::FrameCache;
use crate::Result;
use crate::types::CacheKey;

/// Bounded least-recently-used cache keyed by entry count
#[derive(Debug)]
pub struct MemoryFrameCache {
    entries: Mutex<LruCache<CacheKey, Bytes>>,
}

impl MemoryFrameCache {
    /// Create a cache holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present, without affecting recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait::async_trait]
impl FrameCache for MemoryFrameCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        let displaced = self.entries.lock().push(key.clone(), data);
        if let Some((evicted, _)) = displaced.filter(|(displaced, _)| displaced != key) {
            trace!(evicted = %evicted, "Memory cache full, evicted oldest entry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u64) -> CacheKey {
        CacheKey::new("http://host/stream", index)
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = MemoryFrameCache::new(3);
        cache.put(&key(10), Bytes::from_static(b"10")).await.unwrap();
        cache.put(&key(11), Bytes::from_static(b"11")).await.unwrap();
        cache.put(&key(5), Bytes::from_static(b"5")).await.unwrap();

        // Touch 10 so 11 becomes the oldest
        assert_eq!(cache.get(&key(10)).await.unwrap(), Some(Bytes::from_static(b"10")));

        cache.put(&key(1), Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(11)));
        assert!(cache.contains(&key(10)));
        assert!(cache.contains(&key(5)));
        assert!(cache.contains(&key(1)));
    }

    #[tokio::test]
    async fn overwrite_refreshes_without_growing() {
        let cache = MemoryFrameCache::new(2);
        cache.put(&key(1), Bytes::from_static(b"old")).await.unwrap();
        cache.put(&key(2), Bytes::from_static(b"two")).await.unwrap();
        cache.put(&key(1), Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.put(&key(3), Bytes::from_static(b"three")).await.unwrap();
        assert!(!cache.contains(&key(2)), "2 was least recently used");
        assert_eq!(cache.get(&key(1)).await.unwrap(), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn zero_capacity_holds_one_frame() {
        let cache = MemoryFrameCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = MemoryFrameCache::new(4);
        cache.put(&key(1), Bytes::from_static(b"1")).await.unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key(1)).await.unwrap(), None);
    }
}
