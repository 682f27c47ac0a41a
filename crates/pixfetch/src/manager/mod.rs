//! # Image Manager
//!
//! Entry point tying the cache and the downloader together. A load checks the
//! failure set, looks the image up in memory and then on disk, and only goes to
//! the network on a miss (or when asked to refresh). Concurrent loads of the
//! same URL share one transfer through the downloader.
//!
//! Results come back either on a [`LoadHandle`] or, with [`ImageManager::load_with`],
//! through callbacks run one at a time on the manager's delivery task.

mod delegate;
mod delivery;
pub mod failed;
mod operation;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

pub use delegate::ManagerDelegate;
pub use failed::FailedUrls;
pub use operation::{
    Completion, CompletionCallback, LoadEvent, LoadHandle, LoadOperation, LoadedImage,
    ProgressCallback,
};

use crate::bitmap::Image;
use crate::cache::{CacheConfig, CacheType, CachedImage, DiskQuery, ImageCache, ImageCacheProvider};
use crate::codec::CodecChain;
use crate::config::DownloaderConfig;
use crate::downloader::{DownloadEvent, Downloaded, ImageDownloader};
use crate::error::FetchError;
use crate::options::LoadOptions;
use delivery::DeliveryQueue;
use operation::EventSink;

/// Maps a URL to the key its image is cached under.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Produces the bytes written to disk for a downloaded image. Receives the
/// downloaded bytes, or `None` when the image was transformed.
pub type CacheSerializer = Arc<dyn Fn(&Image, Option<&Bytes>, &Url) -> Option<Bytes> + Send + Sync>;

/// Caller input that names a resource.
pub trait IntoResourceUrl {
    fn into_resource_url(self) -> Result<Url, FetchError>;
}

impl IntoResourceUrl for Url {
    fn into_resource_url(self) -> Result<Url, FetchError> {
        Ok(self)
    }
}

impl IntoResourceUrl for &Url {
    fn into_resource_url(self) -> Result<Url, FetchError> {
        Ok(self.clone())
    }
}

impl IntoResourceUrl for &str {
    fn into_resource_url(self) -> Result<Url, FetchError> {
        let trimmed = self.trim();
        if trimmed.is_empty() {
            return Err(FetchError::MalformedRequest("empty URL".to_string()));
        }
        Url::parse(trimmed).map_err(|e| FetchError::MalformedRequest(format!("{trimmed}: {e}")))
    }
}

impl IntoResourceUrl for String {
    fn into_resource_url(self) -> Result<Url, FetchError> {
        self.as_str().into_resource_url()
    }
}

impl<T: IntoResourceUrl> IntoResourceUrl for Option<T> {
    fn into_resource_url(self) -> Result<Url, FetchError> {
        match self {
            Some(url) => url.into_resource_url(),
            None => Err(FetchError::MalformedRequest("no resource".to_string())),
        }
    }
}

pub(crate) struct ManagerInner {
    cache: Arc<dyn ImageCacheProvider>,
    downloader: ImageDownloader,
    failed: FailedUrls,
    running: Mutex<HashMap<u64, Arc<LoadOperation>>>,
    delegate: Option<Arc<dyn ManagerDelegate>>,
    cache_key_filter: Option<CacheKeyFilter>,
    cache_serializer: Option<CacheSerializer>,
    delivery: Arc<DeliveryQueue>,
    next_id: AtomicU64,
}

impl ManagerInner {
    fn remove_running(&self, id: u64) {
        self.running.lock().remove(&id);
    }

    fn cache_key(&self, url: &Url) -> String {
        match &self.cache_key_filter {
            Some(filter) => filter(url),
            None => url.as_str().to_string(),
        }
    }

    fn should_download(&self, url: &Url) -> bool {
        self.delegate
            .as_ref()
            .is_none_or(|delegate| delegate.should_download(url))
    }

    fn should_block(&self, url: &Url, error: &FetchError) -> bool {
        match &self.delegate {
            Some(delegate) => delegate.should_block_failed_url(url, error),
            None => !error.is_transient(),
        }
    }

    /// Decide what to do with the cache lookup result: finish with it, or go to
    /// the network.
    fn resolve_cached(
        self: &Arc<Self>,
        operation: Arc<LoadOperation>,
        url: Url,
        key: String,
        options: LoadOptions,
        cached: CachedImage,
    ) {
        let has_cached = cached.image.is_some();
        let should_download = !options.contains(LoadOptions::FROM_CACHE_ONLY)
            && (!has_cached || options.contains(LoadOptions::REFRESH_CACHED))
            && self.should_download(&url);

        if !should_download {
            let loaded = if has_cached {
                LoadedImage::from_cache(cached)
            } else {
                LoadedImage::default()
            };
            debug!(url = %url, cache_type = ?loaded.cache_type, "Load resolved without download");
            operation.complete(Ok(loaded));
            return;
        }

        if has_cached {
            // Hand out the cached copy while the refresh runs
            operation.deliver(LoadedImage::from_cache(cached.clone()));
        }

        let fetch_options = options.to_fetch_options(has_cached);
        let (token, events) = self.downloader.download(&url, fetch_options);
        if !operation.set_download(token) {
            return;
        }

        tokio::spawn(watch_download(
            Arc::downgrade(self),
            operation,
            url,
            key,
            options,
            cached,
            events,
        ));
    }

    fn download_failed(&self, operation: &Arc<LoadOperation>, url: Url, error: FetchError) {
        if self.should_block(&url, &error) {
            debug!(url = %url, error = %error, "Adding URL to the failure set");
            self.failed.insert(url);
        } else {
            debug!(url = %url, error = %error, "Download failed");
        }
        operation.complete(Err(error));
    }

    async fn download_succeeded(
        &self,
        operation: &Arc<LoadOperation>,
        url: Url,
        key: String,
        options: LoadOptions,
        cached: CachedImage,
        downloaded: Downloaded,
    ) {
        if options.contains(LoadOptions::RETRY_FAILED) {
            self.failed.remove(&url);
        }

        let Downloaded { image, data } = downloaded;
        let Some(image) = image else {
            debug!(url = %url, "Cached image is still current");
            let loaded = if cached.image.is_some() {
                LoadedImage {
                    not_modified: true,
                    ..LoadedImage::from_cache(cached)
                }
            } else {
                LoadedImage {
                    not_modified: true,
                    ..LoadedImage::default()
                }
            };
            operation.complete(Ok(loaded));
            return;
        };

        let (image, cache_data) = self
            .prepare_for_cache(&url, options, image, data.clone())
            .await;
        if operation.is_cancelled() {
            return;
        }

        let to_disk = !options.contains(LoadOptions::CACHE_MEMORY_ONLY);
        self.cache
            .store(Some(image.clone()), cache_data, &key, to_disk)
            .await;

        operation.complete(Ok(LoadedImage {
            image: Some(image),
            data,
            cache_type: CacheType::None,
            not_modified: false,
        }));
    }

    /// Run the transform hook and the cache serializer off the async workers.
    async fn prepare_for_cache(
        &self,
        url: &Url,
        options: LoadOptions,
        image: Image,
        data: Option<Bytes>,
    ) -> (Image, Option<Bytes>) {
        let delegate = self
            .delegate
            .clone()
            .filter(|_| !image.is_animated() || options.contains(LoadOptions::TRANSFORM_ANIMATED_IMAGE));
        let serializer = self.cache_serializer.clone();
        if delegate.is_none() && serializer.is_none() {
            return (image, data);
        }

        let fallback = (image.clone(), data.clone());
        let hook_url = url.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            let transformed = delegate.and_then(|d| d.transform_downloaded_image(&image, &hook_url));
            let (image, data) = match transformed {
                Some(transformed) if !transformed.ptr_eq(&image) => (transformed, None),
                _ => (image, data),
            };
            let data = match serializer {
                Some(serialize) => serialize(&image, data.as_ref(), &hook_url),
                None => data,
            };
            (image, data)
        })
        .await;

        prepared.unwrap_or_else(|e| {
            warn!(url = %url, error = %e, "Image transform task failed");
            fallback
        })
    }
}

/// Forward download events to the load, then finish it once the transfer ends.
#[instrument(skip_all, fields(id = operation.id(), url = %url), level = "debug")]
async fn watch_download(
    manager: Weak<ManagerInner>,
    operation: Arc<LoadOperation>,
    url: Url,
    key: String,
    options: LoadOptions,
    cached: CachedImage,
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
) {
    let result = loop {
        match events.recv().await {
            Some(DownloadEvent::Progress { received, expected }) => {
                operation.progress(received, expected)
            }
            Some(DownloadEvent::Partial(image)) => operation.deliver(LoadedImage {
                image: Some(image),
                ..LoadedImage::default()
            }),
            Some(DownloadEvent::Finished(result)) => break result,
            // The transfer was stopped without a result
            None => break Err(FetchError::Cancelled),
        }
    };

    if operation.is_cancelled() {
        return;
    }
    let Some(inner) = manager.upgrade() else {
        operation.abandon();
        return;
    };

    match result {
        Ok(downloaded) => {
            inner
                .download_succeeded(&operation, url, key, options, cached, downloaded)
                .await
        }
        Err(error) => inner.download_failed(&operation, url, error),
    }
}

/// Cache-then-network image loader.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl ImageManager {
    pub fn builder() -> ImageManagerBuilder {
        ImageManagerBuilder::default()
    }

    /// Load `url`, delivering events on the returned handle.
    pub fn load(&self, url: impl IntoResourceUrl, options: LoadOptions) -> LoadHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let operation = self.start(url.into_resource_url(), options, EventSink::Channel(sender));
        LoadHandle::new(operation, receiver)
    }

    /// Load `url`, running the callbacks on the manager's delivery task.
    pub fn load_with(
        &self,
        url: impl IntoResourceUrl,
        options: LoadOptions,
        on_progress: Option<ProgressCallback>,
        on_complete: CompletionCallback,
    ) -> Arc<LoadOperation> {
        let sink = EventSink::Callbacks {
            delivery: self.inner.delivery.clone(),
            on_progress,
            on_complete,
        };
        self.start(url.into_resource_url(), options, sink)
    }

    fn start(
        &self,
        url: Result<Url, FetchError>,
        options: LoadOptions,
        sink: EventSink,
    ) -> Arc<LoadOperation> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::downgrade(&self.inner);

        let url = match url {
            Ok(url) => url,
            Err(e) => {
                debug!(id, error = %e, "Rejecting load");
                let operation = LoadOperation::new(id, None, manager, sink);
                operation.complete(Err(e));
                return operation;
            }
        };

        let operation = LoadOperation::new(id, Some(url.clone()), manager.clone(), sink);
        if !options.contains(LoadOptions::RETRY_FAILED) && self.inner.failed.contains(&url) {
            debug!(id, url = %url, "URL is in the failure set");
            operation.complete(Err(FetchError::Blocklisted(url)));
            return operation;
        }

        self.inner.running.lock().insert(id, operation.clone());
        let key = self.inner.cache_key(&url);
        debug!(id, url = %url, key = %key, ?options, "Starting load");

        if !options.contains(LoadOptions::QUERY_DATA_WHEN_IN_MEMORY) {
            if let Some(image) = self.inner.cache.lookup_memory(&key) {
                let cached = CachedImage {
                    image: Some(image),
                    data: None,
                    cache_type: CacheType::Memory,
                };
                self.inner
                    .resolve_cached(operation.clone(), url, key, options, cached);
                return operation;
            }
        }

        let query = DiskQuery {
            decode: true,
            scale_down: options.contains(LoadOptions::SCALE_DOWN_LARGE_IMAGES),
        };

        if options.contains(LoadOptions::QUERY_DISK_SYNC) {
            let cached = self.inner.cache.query_disk_blocking(&key, query);
            self.inner
                .resolve_cached(operation.clone(), url, key, options, cached);
            return operation;
        }

        let cancel = CancellationToken::new();
        if !operation.set_cache_query(cancel.clone()) {
            return operation;
        }

        let cache = self.inner.cache.clone();
        let pending = operation.clone();
        tokio::spawn(async move {
            let cached = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                cached = cache.query_disk(&key, query) => cached,
            };

            if pending.is_cancelled() {
                return;
            }
            match manager.upgrade() {
                Some(inner) => inner.resolve_cached(pending, url, key, options, cached),
                None => pending.abandon(),
            }
        });

        operation
    }

    /// Cancel every load in flight.
    pub fn cancel_all(&self) {
        let running: Vec<_> = self.inner.running.lock().values().cloned().collect();
        debug!(count = running.len(), "Cancelling all loads");
        for operation in running {
            operation.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.running.lock().is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    pub fn cache_key_for_url(&self, url: &Url) -> String {
        self.inner.cache_key(url)
    }

    /// Whether the image for `url` is in memory or on disk.
    pub async fn cached_image_exists(&self, url: &Url) -> bool {
        let key = self.inner.cache_key(url);
        if self.inner.cache.exists_in_memory(&key) {
            return true;
        }
        self.inner.cache.exists_on_disk(&key).await
    }

    pub async fn disk_image_exists(&self, url: &Url) -> bool {
        let key = self.inner.cache_key(url);
        self.inner.cache.exists_on_disk(&key).await
    }

    /// Store `image` under the key for `url`, in memory and on disk.
    pub async fn save_image_to_cache(&self, image: Image, url: &Url) {
        let key = self.inner.cache_key(url);
        self.inner.cache.store(Some(image), None, &key, true).await;
    }

    pub fn failed_urls(&self) -> &FailedUrls {
        &self.inner.failed
    }

    pub fn cache(&self) -> &Arc<dyn ImageCacheProvider> {
        &self.inner.cache
    }

    pub fn downloader(&self) -> &ImageDownloader {
        &self.inner.downloader
    }
}

impl Default for ImageManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageManager")
            .field("running", &self.running_count())
            .field("failed", &self.inner.failed.len())
            .field("downloader", &self.inner.downloader)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ImageManagerBuilder {
    cache: Option<Arc<dyn ImageCacheProvider>>,
    cache_config: Option<CacheConfig>,
    downloader: Option<ImageDownloader>,
    downloader_config: Option<DownloaderConfig>,
    codecs: Option<Arc<CodecChain>>,
    delegate: Option<Arc<dyn ManagerDelegate>>,
    cache_key_filter: Option<CacheKeyFilter>,
    cache_serializer: Option<CacheSerializer>,
}

impl ImageManagerBuilder {
    /// Use `cache` instead of an [`ImageCache`] built from the cache config.
    pub fn with_cache(mut self, cache: Arc<dyn ImageCacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    /// Use `downloader` instead of one built from the downloader config.
    pub fn with_downloader(mut self, downloader: ImageDownloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_downloader_config(mut self, config: DownloaderConfig) -> Self {
        self.downloader_config = Some(config);
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecChain>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ManagerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_cache_key_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Url) -> String + Send + Sync + 'static,
    {
        self.cache_key_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_cache_serializer<F>(mut self, serializer: F) -> Self
    where
        F: Fn(&Image, Option<&Bytes>, &Url) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.cache_serializer = Some(Arc::new(serializer));
        self
    }

    pub fn build(self) -> ImageManager {
        let codecs = match (&self.codecs, &self.downloader) {
            (Some(codecs), _) => codecs.clone(),
            (None, Some(downloader)) => downloader.codecs().clone(),
            (None, None) => Arc::new(CodecChain::with_defaults()),
        };

        let downloader = self.downloader.unwrap_or_else(|| {
            ImageDownloader::builder()
                .with_config(self.downloader_config.unwrap_or_default())
                .with_codecs(codecs.clone())
                .build()
        });

        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(ImageCache::new(
                self.cache_config.unwrap_or_default(),
                codecs,
            ))
        });

        ImageManager {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                failed: FailedUrls::new(),
                running: Mutex::new(HashMap::new()),
                delegate: self.delegate,
                cache_key_filter: self.cache_key_filter,
                cache_serializer: self.cache_serializer,
                delivery: Arc::new(DeliveryQueue::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}
