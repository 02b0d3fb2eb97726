//! Disk-backed frame cache

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::FrameCache;
use crate::types::CacheKey;
use crate::{Result, StreamError};

/// One file per frame under a per-origin directory
///
/// Layout: `root/<first 16 hex chars of sha256(origin)>/<index>.jpg`.
/// Writes land in a uniquely named `.part` file first and are renamed into
/// place, so readers never observe a partially written frame.
#[derive(Debug)]
pub struct DiskFrameCache {
    root: PathBuf,
    write_seq: AtomicU64,
}

impl DiskFrameCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| StreamError::io_error(&root, e))?;
        debug!(root = %root.display(), "Opened disk frame cache");
        Ok(Self { root, write_seq: AtomicU64::new(0) })
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all frames of `origin`
    pub fn origin_dir(&self, origin: &str) -> PathBuf {
        let digest = Sha256::digest(origin.as_bytes());
        self.root.join(&hex::encode(digest)[..16])
    }

    /// File path for `key`
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.origin_dir(&key.origin).join(format!("{}.jpg", key.index))
    }
}

#[async_trait::async_trait]
impl FrameCache for DiskFrameCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StreamError::cache_failed(key.storage_key(), e)),
        }
    }

    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        let dir = self.origin_dir(&key.origin);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StreamError::cache_failed(key.storage_key(), e))?;

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let final_path = dir.join(format!("{}.jpg", key.index));
        let tmp_path = dir.join(format!("{}.{}-{}.part", key.index, std::process::id(), seq));

        if let Err(e) = tokio::fs::write(&tmp_path, &data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StreamError::cache_failed(key.storage_key(), e));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StreamError::cache_failed(key.storage_key(), e));
        }

        trace!(path = %final_path.display(), bytes = data.len(), "Wrote frame to disk cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskFrameCache::open(dir.path().join("frames")).await.unwrap();
        let key = CacheKey::new("http://127.0.0.1:8080/stream", 50);

        assert_eq!(cache.get(&key).await.unwrap(), None);
        let jpeg = Bytes::from_static(b"\xFF\xD8jpeg\xFF\xD9");
        cache.put(&key, jpeg.clone()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(jpeg));
        assert!(cache.path_for(&key).exists());
    }

    #[tokio::test]
    async fn origins_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskFrameCache::open(dir.path()).await.unwrap();
        let a = CacheKey::new("http://a/stream", 1);
        let b = CacheKey::new("http://b/stream", 1);

        cache.put(&a, Bytes::from_static(b"from-a")).await.unwrap();
        assert_eq!(cache.get(&b).await.unwrap(), None);
        assert_ne!(cache.origin_dir("http://a/stream"), cache.origin_dir("http://b/stream"));
    }

    #[tokio::test]
    async fn overwrite_leaves_no_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskFrameCache::open(dir.path()).await.unwrap();
        let key = CacheKey::new("origin", 3);

        cache.put(&key, Bytes::from_static(b"first")).await.unwrap();
        cache.put(&key, Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(Bytes::from_static(b"second")));

        let mut entries = tokio::fs::read_dir(cache.origin_dir("origin")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".part"), "leftover temp file {name}");
        }
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskFrameCache::open(dir.path()).await.unwrap());
        let payload = Bytes::from(vec![0xAB; 4096]);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let payload = payload.clone();
            tasks.push(tokio::spawn(async move {
                cache.put(&CacheKey::new("shared", 7), payload).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(cache.get(&CacheKey::new("shared", 7)).await.unwrap(), Some(payload));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_put_get_round_trips(
            data in prop::collection::vec(any::<u8>(), 1..2048),
            index in 0u64..100_000,
            origin in "[a-z]{1,12}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let read_back = rt.block_on(async {
                let cache = DiskFrameCache::open(dir.path()).await.unwrap();
                let key = CacheKey::new(origin, index);
                cache.put(&key, Bytes::from(data.clone())).await.unwrap();
                cache.get(&key).await.unwrap()
            });
            prop_assert_eq!(read_back, Some(Bytes::from(data)));
        }
    }
}
