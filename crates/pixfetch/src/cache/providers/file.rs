//! # File Cache
//!
//! Persistent byte storage: one data file plus a JSON metadata sidecar per key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::cache::types::{CacheMetadata, CacheResult, SweepStats, cache_file_name};

const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
    enabled: bool,
}

impl FileCache {
    /// Create a new file cache with the specified directory
    pub fn new(cache_dir: PathBuf, enabled: bool) -> Self {
        Self {
            cache_dir,
            initialized: Arc::new(AtomicBool::new(false)),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create the cache directory once
    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) || !self.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_initialized_blocking(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) || !self.enabled {
            return Ok(());
        }
        std::fs::create_dir_all(&self.cache_dir)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(key))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.data_path(key).with_extension(META_EXTENSION)
    }

    pub async fn contains(&self, key: &str) -> CacheResult<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let data_exists = fs::try_exists(self.data_path(key)).await?;
        let meta_exists = fs::try_exists(self.metadata_path(key)).await?;
        Ok(data_exists && meta_exists)
    }

    /// Read an entry. Expired or corrupt entries read as a miss and are removed
    /// in the background.
    pub async fn get(&self, key: &str) -> CacheResult<Option<(Bytes, CacheMetadata)>> {
        if !self.enabled {
            return Ok(None);
        }

        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);

        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read cache metadata file");
                return Ok(None);
            }
        };

        let metadata = match parse_metadata(&metadata_bytes, &meta_path) {
            Some(metadata) if !metadata.is_expired() => metadata,
            _ => {
                tokio::spawn(async move {
                    let _ = fs::remove_file(&data_path).await;
                    let _ = fs::remove_file(&meta_path).await;
                });
                return Ok(None);
            }
        };

        match fs::read(&data_path).await {
            Ok(bytes) => Ok(Some((Bytes::from(bytes), metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(path = ?data_path, error = %e, "Failed to read cache data file");
                Ok(None)
            }
        }
    }

    /// Same as [`FileCache::get`], on the calling thread.
    pub fn get_blocking(&self, key: &str) -> CacheResult<Option<(Bytes, CacheMetadata)>> {
        if !self.enabled {
            return Ok(None);
        }

        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);

        let metadata_bytes = match std::fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read cache metadata file");
                return Ok(None);
            }
        };

        let metadata = match parse_metadata(&metadata_bytes, &meta_path) {
            Some(metadata) if !metadata.is_expired() => metadata,
            _ => {
                let _ = std::fs::remove_file(&data_path);
                let _ = std::fs::remove_file(&meta_path);
                return Ok(None);
            }
        };

        match std::fs::read(&data_path) {
            Ok(bytes) => Ok(Some((Bytes::from(bytes), metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(path = ?data_path, error = %e, "Failed to read cache data file");
                Ok(None)
            }
        }
    }

    pub async fn put(&self, key: &str, data: Bytes, metadata: CacheMetadata) -> CacheResult<()> {
        if !self.enabled {
            return Ok(());
        }

        self.ensure_initialized().await?;

        let metadata_json = serde_json::to_vec(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Body first, so a metadata file never describes a missing body
        let data_path = self.data_path(key);
        write_replacing(&data_path, &data).await?;
        if let Err(e) = write_replacing(&self.metadata_path(key), &metadata_json).await {
            let _ = fs::remove_file(&data_path).await;
            return Err(e);
        }

        debug!(key = %key, size = metadata.size, "Stored image bytes on disk");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        if !self.enabled {
            return Ok(());
        }
        remove_pair(&self.data_path(key), &self.metadata_path(key)).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove cache file"),
            }
        }

        debug!(removed, "Cleared disk cache");
        Ok(())
    }

    /// Total size of all valid entries in bytes
    pub async fn total_size(&self) -> CacheResult<u64> {
        Ok(self
            .scan()
            .await?
            .iter()
            .map(|(_, metadata)| metadata.size)
            .sum())
    }

    /// Delete expired entries, then the oldest entries until the cache is at most
    /// half of `max_size` (when over `max_size`). A `max_size` of 0 skips the size pass.
    pub async fn sweep(&self, max_size: u64) -> CacheResult<SweepStats> {
        let mut stats = SweepStats::default();
        if !self.enabled {
            return Ok(stats);
        }

        let mut live = Vec::new();
        for (meta_path, metadata) in self.scan().await? {
            if metadata.is_expired() {
                remove_pair(&meta_path.with_extension(""), &meta_path).await?;
                stats.removed_expired += 1;
            } else {
                live.push((meta_path, metadata));
            }
        }

        let mut total: u64 = live.iter().map(|(_, metadata)| metadata.size).sum();
        if max_size > 0 && total > max_size {
            let target = max_size / 2;
            live.sort_by_key(|(_, metadata)| metadata.cached_at);
            for (meta_path, metadata) in live {
                if total <= target {
                    break;
                }
                remove_pair(&meta_path.with_extension(""), &meta_path).await?;
                total = total.saturating_sub(metadata.size);
                stats.removed_for_size += 1;
            }
        }

        stats.remaining_bytes = total;
        debug!(
            removed_expired = stats.removed_expired,
            removed_for_size = stats.removed_for_size,
            remaining_bytes = stats.remaining_bytes,
            "Swept file cache"
        );
        Ok(stats)
    }

    /// All readable metadata files. Unreadable ones are deleted along with their data.
    async fn scan(&self) -> CacheResult<Vec<(PathBuf, CacheMetadata)>> {
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read cache metadata file");
                    continue;
                }
            };
            match parse_metadata(&bytes, &path) {
                Some(metadata) => found.push((path, metadata)),
                None => remove_pair(&path.with_extension(""), &path).await?,
            }
        }
        Ok(found)
    }
}

fn parse_metadata(bytes: &[u8], path: &Path) -> Option<CacheMetadata> {
    match serde_json::from_slice(bytes) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to parse cache metadata");
            None
        }
    }
}

/// Write through a sibling temporary file so readers never see a partial file.
async fn write_replacing(path: &Path, contents: &[u8]) -> CacheResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let result = match fs::write(&temp, contents).await {
        Ok(()) => fs::rename(&temp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!(path = ?path, error = %e, "Failed to write cache file");
        let _ = fs::remove_file(&temp).await;
    }
    result
}

async fn remove_pair(data_path: &Path, meta_path: &Path) -> CacheResult<()> {
    let data_result = fs::remove_file(data_path).await;
    let meta_result = fs::remove_file(meta_path).await;

    match (data_result, meta_result) {
        (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
            warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
            Err(e)
        }
        (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
            warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
            Err(e)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache() -> (tempfile::TempDir, FileCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("images"), true);
        (dir, cache)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (_dir, cache) = cache();
        let data = Bytes::from_static(b"payload");
        cache
            .put("a", data.clone(), CacheMetadata::new("a", 7))
            .await
            .unwrap();

        assert!(cache.contains("a").await.unwrap());
        let (bytes, metadata) = cache.get("a").await.unwrap().unwrap();
        assert_eq!(bytes, data);
        assert_eq!(metadata.key, "a");

        let (blocking, _) = cache.get_blocking("a").unwrap().unwrap();
        assert_eq!(blocking, data);

        cache.remove("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(!cache.contains("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_reads_as_miss() {
        let (_dir, cache) = cache();
        cache
            .put("a", Bytes::from_static(b"x"), CacheMetadata::new("a", 1))
            .await
            .unwrap();
        std::fs::write(cache.metadata_path("a"), b"{not json").unwrap();

        assert!(cache.get_blocking("a").unwrap().is_none());
        assert!(!cache.data_path("a").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_oldest() {
        let (_dir, cache) = cache();

        let mut expired = CacheMetadata::new("old", 10);
        expired.expires_at = Some(expired.cached_at.saturating_sub(5));
        cache
            .put("old", Bytes::from(vec![0u8; 10]), expired)
            .await
            .unwrap();

        for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
            let mut metadata =
                CacheMetadata::new(*key, 40).with_expiration(Duration::from_secs(3600));
            metadata.cached_at += i as u64;
            cache
                .put(key, Bytes::from(vec![1u8; 40]), metadata)
                .await
                .unwrap();
        }

        let stats = cache.sweep(100).await.unwrap();
        assert_eq!(stats.removed_expired, 1);
        assert_eq!(stats.removed_for_size, 2);
        assert_eq!(stats.remaining_bytes, 40);
        assert!(!cache.contains("k1").await.unwrap());
        assert!(!cache.contains("k2").await.unwrap());
        assert!(cache.contains("k3").await.unwrap());
        assert_eq!(cache.total_size().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("off"), false);
        cache
            .put("a", Bytes::from_static(b"x"), CacheMetadata::new("a", 1))
            .await
            .unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(!dir.path().join("off").exists());
    }
}
