//! # Cache Manager
//!
//! The default [`ImageCacheProvider`]: a weighted memory tier of decoded images in
//! front of a file tier of encoded bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::bitmap::{Image, ImageFormat};
use crate::cache::providers::{FileCache, ImageCacheProvider, MemoryCache};
use crate::cache::types::{
    CacheConfig, CacheMetadata, CacheResult, CacheType, CachedImage, DiskQuery, SweepStats,
};
use crate::codec::{CodecChain, DecompressOptions};

/// Cache manager handling both memory and file caching
#[derive(Clone)]
pub struct ImageCache {
    memory_cache: Option<MemoryCache<Image>>,
    file_cache: Arc<FileCache>,
    codecs: Arc<CodecChain>,
    config: Arc<CacheConfig>,
}

impl ImageCache {
    /// Create a new cache manager with the specified configuration
    pub fn new(mut config: CacheConfig, codecs: Arc<CodecChain>) -> Self {
        // If no disk cache path provided, use system temp
        let cache_dir = config
            .disk_cache_path
            .get_or_insert_with(|| std::env::temp_dir().join("pixfetch-cache"))
            .clone();

        let memory_cache = (config.enabled && config.max_memory_cost > 0)
            .then(|| MemoryCache::new(config.max_memory_cost, None));

        let file_cache = Arc::new(FileCache::new(
            cache_dir,
            config.enabled && config.max_disk_cache_size > 0,
        ));

        Self {
            memory_cache,
            file_cache,
            codecs,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn codecs(&self) -> &Arc<CodecChain> {
        &self.codecs
    }

    /// Remove a key from memory and optionally from disk
    pub async fn remove(&self, key: &str, from_disk: bool) -> CacheResult<()> {
        if let Some(memory) = &self.memory_cache {
            memory.remove(key);
        }
        if from_disk {
            self.file_cache.remove(key).await?;
        }
        Ok(())
    }

    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory_cache {
            memory.clear();
        }
    }

    pub async fn clear_disk(&self) -> CacheResult<()> {
        self.file_cache.clear().await
    }

    /// Bytes currently held by the disk tier
    pub async fn disk_usage(&self) -> CacheResult<u64> {
        self.file_cache.total_size().await
    }

    /// Perform maintenance tasks on the cache.
    /// Applies pending memory evictions and sweeps expired or excess files.
    pub async fn maintain(&self) -> CacheResult<SweepStats> {
        if !self.config.enabled {
            return Ok(SweepStats::default());
        }

        if let Some(memory) = &self.memory_cache {
            memory.sweep();
        }
        self.file_cache.sweep(self.config.max_disk_cache_size).await
    }

    /// Start a background maintenance task
    pub fn start_maintenance_task(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.maintain().await {
                    warn!(error = %e, "Cache maintenance error");
                }
            }
        })
    }

    fn remember(&self, key: &str, image: &Image) {
        if !self.config.cache_images_in_memory {
            return;
        }
        if let Some(memory) = &self.memory_cache {
            memory.insert(key, image.clone());
        }
    }

    fn resolve(&self, key: &str, data: Option<Bytes>, decoded: Option<Image>) -> CachedImage {
        match (self.lookup_memory(key), data) {
            (Some(image), data) => CachedImage {
                image: Some(image),
                data,
                cache_type: CacheType::Memory,
            },
            (None, Some(data)) => {
                if let Some(image) = &decoded {
                    self.remember(key, image);
                }
                CachedImage {
                    image: decoded,
                    data: Some(data),
                    cache_type: CacheType::Disk,
                }
            }
            (None, None) => CachedImage::miss(),
        }
    }
}

/// Decode cached bytes, preparing the image for display when configured to.
fn decode_cached(
    codecs: &CodecChain,
    config: &CacheConfig,
    key: &str,
    data: &[u8],
    scale_down: bool,
) -> Option<Image> {
    let image = match codecs.decode(data) {
        Ok(image) => image,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to decode cached image");
            return None;
        }
    };

    if config.decompress_images {
        Some(codecs.decompress(image, data, DecompressOptions { scale_down }))
    } else {
        Some(image)
    }
}

#[async_trait]
impl ImageCacheProvider for ImageCache {
    fn lookup_memory(&self, key: &str) -> Option<Image> {
        if !self.config.enabled {
            return None;
        }
        self.memory_cache.as_ref().and_then(|memory| memory.get(key))
    }

    #[instrument(skip(self), level = "debug")]
    async fn query_disk(&self, key: &str, query: DiskQuery) -> CachedImage {
        if !self.config.enabled {
            return CachedImage::miss();
        }

        let data = match self.file_cache.get(key).await {
            Ok(entry) => entry.map(|(data, _)| data),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read disk cache");
                None
            }
        };

        let decoded = match &data {
            Some(data) if query.decode && !self.exists_in_memory(key) => {
                let codecs = self.codecs.clone();
                let config = self.config.clone();
                let owned_key = key.to_string();
                let bytes = data.clone();
                tokio::task::spawn_blocking(move || {
                    decode_cached(&codecs, &config, &owned_key, &bytes, query.scale_down)
                })
                .await
                .unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Cached image decode task failed");
                    None
                })
            }
            _ => None,
        };

        let result = self.resolve(key, data, decoded);
        debug!(key = %key, cache_type = ?result.cache_type, "Disk query finished");
        result
    }

    fn query_disk_blocking(&self, key: &str, query: DiskQuery) -> CachedImage {
        if !self.config.enabled {
            return CachedImage::miss();
        }

        let data = match self.file_cache.get_blocking(key) {
            Ok(entry) => entry.map(|(data, _)| data),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read disk cache");
                None
            }
        };

        let decoded = match &data {
            Some(data) if query.decode && !self.exists_in_memory(key) => {
                decode_cached(&self.codecs, &self.config, key, data, query.scale_down)
            }
            _ => None,
        };

        self.resolve(key, data, decoded)
    }

    fn exists_in_memory(&self, key: &str) -> bool {
        self.config.enabled
            && self
                .memory_cache
                .as_ref()
                .is_some_and(|memory| memory.contains(key))
    }

    async fn exists_on_disk(&self, key: &str) -> bool {
        match self.file_cache.contains(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to check disk cache");
                false
            }
        }
    }

    async fn store(&self, image: Option<Image>, data: Option<Bytes>, key: &str, to_disk: bool) {
        if !self.config.enabled {
            return;
        }

        if let (Some(memory), Some(image)) = (&self.memory_cache, &image) {
            memory.insert(key, image.clone());
        }

        if !to_disk || !self.file_cache.is_enabled() {
            return;
        }

        let data = match (data, image) {
            (Some(data), _) => data,
            (None, Some(image)) => {
                let codecs = self.codecs.clone();
                let encoded = tokio::task::spawn_blocking(move || {
                    codecs.encode(&image, ImageFormat::Undefined)
                })
                .await;
                match encoded {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        warn!(key = %key, error = %e, "Failed to encode image for disk cache");
                        return;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Image encode task failed");
                        return;
                    }
                }
            }
            (None, None) => return,
        };

        let metadata = CacheMetadata::new(key, data.len() as u64)
            .with_expiration(self.config.max_cache_age)
            .with_content_type(ImageFormat::detect(&data).mime_type());

        if let Err(e) = self.file_cache.put(key, data, metadata).await {
            warn!(key = %key, error = %e, "Failed to write disk cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestCodec, test_image_bytes};

    fn test_chain() -> Arc<CodecChain> {
        let chain = CodecChain::new();
        chain.add_codec(Arc::new(TestCodec::default()));
        Arc::new(chain)
    }

    fn config_in(dir: &tempfile::TempDir) -> CacheConfig {
        CacheConfig {
            disk_cache_path: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disk_hit_is_decoded_and_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_image_bytes(4, 3, 1);

        let writer = ImageCache::new(config_in(&dir), test_chain());
        writer.store(None, Some(data.clone()), "k", true).await;
        assert!(writer.exists_on_disk("k").await);

        // Fresh instance, empty memory tier
        let cache = ImageCache::new(config_in(&dir), test_chain());
        assert!(cache.lookup_memory("k").is_none());

        let hit = cache.query_disk("k", DiskQuery::default()).await;
        assert_eq!(hit.cache_type, CacheType::Disk);
        assert_eq!(hit.data.as_ref(), Some(&data));
        let image = hit.image.unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));

        assert!(cache.lookup_memory("k").unwrap().ptr_eq(&image));
    }

    #[tokio::test]
    async fn test_memory_hit_reports_memory_tier_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(config_in(&dir), test_chain());
        let data = test_image_bytes(2, 2, 1);
        let image = Image::from_rgba(2, 2, vec![255u8; 16]);

        cache.store(Some(image.clone()), Some(data.clone()), "k", true).await;

        let hit = cache.query_disk("k", DiskQuery::default()).await;
        assert_eq!(hit.cache_type, CacheType::Memory);
        assert!(hit.image.unwrap().ptr_eq(&image));
        assert_eq!(hit.data, Some(data));

        let blocking = cache.query_disk_blocking("k", DiskQuery::default());
        assert_eq!(blocking.cache_type, CacheType::Memory);
    }

    #[tokio::test]
    async fn test_memory_only_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(config_in(&dir), test_chain());
        let image = Image::from_rgba(1, 1, vec![0u8, 0, 0, 255]);

        cache.store(Some(image), None, "k", false).await;
        assert!(cache.exists_in_memory("k"));
        assert!(!cache.exists_on_disk("k").await);

        cache.remove("k", true).await.unwrap();
        assert!(!cache.exists_in_memory("k"));
        assert!(cache.query_disk("k", DiskQuery::default()).await.is_miss());
    }

    #[tokio::test]
    async fn test_store_encodes_when_bytes_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(config_in(&dir), Arc::new(CodecChain::with_defaults()));
        let opaque = Image::from_rgba(3, 3, vec![120u8; 36]).with_alpha(false);

        cache.store(Some(opaque), None, "jpeg", true).await;
        cache.clear_memory();

        let hit = cache.query_disk_blocking("jpeg", DiskQuery::default());
        assert_eq!(hit.cache_type, CacheType::Disk);
        assert_eq!(ImageFormat::detect(hit.data.as_ref().unwrap()), ImageFormat::Jpeg);
        assert_eq!(hit.image.unwrap().width(), 3);
    }

    #[tokio::test]
    async fn test_disabled_cache_misses() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            enabled: false,
            ..config_in(&dir)
        };
        let cache = ImageCache::new(config, test_chain());
        cache
            .store(None, Some(test_image_bytes(1, 1, 1)), "k", true)
            .await;

        assert!(cache.query_disk("k", DiskQuery::default()).await.is_miss());
        assert!(!cache.exists_on_disk("k").await);
        assert_eq!(cache.maintain().await.unwrap(), SweepStats::default());
    }

    #[tokio::test]
    async fn test_disk_usage_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(config_in(&dir), test_chain());
        let data = test_image_bytes(2, 2, 1);
        cache.store(None, Some(data.clone()), "k", true).await;

        assert_eq!(cache.disk_usage().await.unwrap(), data.len() as u64);
        cache.clear_disk().await.unwrap();
        assert_eq!(cache.disk_usage().await.unwrap(), 0);
    }
}
