//! # Image Downloader
//!
//! Pool of [`FetchOperation`]s keyed by URL. Concurrent requests for the same URL
//! join the operation already in flight instead of issuing a second transfer;
//! each join is a separate [`DownloadToken`] with its own event channel.

mod events;
pub mod operation;
mod queue;
mod token;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use url::Url;

pub use events::{DownloadEvent, DownloadLifecycleEvent, Downloaded};
pub use operation::{EventSender, FetchOperation, OperationState, SessionHandle};
pub use token::DownloadToken;

use crate::codec::CodecChain;
use crate::config::DownloaderConfig;
use crate::host::BackgroundTaskHost;
use crate::options::FetchOptions;
use crate::transport::{HttpTransport, Transport, TransportRequest};
use operation::{FinishHook, OperationContext};
use queue::DownloadQueue;

/// Rewrites the headers of each request just before it is created.
pub type HeadersFilter = Arc<dyn Fn(&Url, HeaderMap) -> HeaderMap + Send + Sync>;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn build_request(
    url: Url,
    options: FetchOptions,
    config: &DownloaderConfig,
    headers: HeaderMap,
) -> TransportRequest {
    TransportRequest {
        url,
        headers,
        timeout: config.download_timeout,
        priority: options.priority(),
        handle_cookies: options.contains(FetchOptions::HANDLE_COOKIES),
        allow_invalid_certificates: options.contains(FetchOptions::ALLOW_INVALID_SSL_CERTIFICATES),
        use_protocol_cache: options.contains(FetchOptions::USE_PROTOCOL_CACHE),
        credentials: config.credentials.clone(),
    }
}

struct DownloaderInner {
    config: DownloaderConfig,
    transport: Arc<dyn Transport>,
    codecs: Arc<CodecChain>,
    operations: Mutex<HashMap<Url, Arc<FetchOperation>>>,
    queue: DownloadQueue,
    headers: RwLock<HeaderMap>,
    headers_filter: Option<HeadersFilter>,
    events: broadcast::Sender<DownloadLifecycleEvent>,
    background: Option<Arc<dyn BackgroundTaskHost>>,
    next_operation_id: AtomicU64,
}

impl DownloaderInner {
    fn operation_finished(&self, url: &Url, id: u64) {
        {
            let mut operations = self.operations.lock();
            if operations.get(url).is_some_and(|op| op.id() == id) {
                operations.remove(url);
            }
        }
        self.queue.finished(id);
    }
}

#[derive(Clone)]
pub struct ImageDownloader {
    inner: Arc<DownloaderInner>,
}

impl ImageDownloader {
    /// A downloader sending through a fresh [`HttpTransport`] built from `config`.
    pub fn new(config: DownloaderConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn builder() -> ImageDownloaderBuilder {
        ImageDownloaderBuilder::default()
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.inner.config
    }

    pub fn codecs(&self) -> &Arc<CodecChain> {
        &self.inner.codecs
    }

    /// Register interest in `url`. Joins the transfer already running for it, or
    /// queues a new one. Events for this registration arrive on the returned receiver.
    pub fn download(
        &self,
        url: &Url,
        options: FetchOptions,
    ) -> (DownloadToken, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        // The headers filter may call back into the downloader.
        let request = self.prepare_request(url, options);

        let mut operations = self.inner.operations.lock();
        if let Some(operation) = operations.get(url) {
            if let Some(handler_id) = operation.add_handler(sender.clone()) {
                debug!(url = %url, id = operation.id(), "Joining in-flight download");
                let token = DownloadToken::new(url.clone(), Arc::downgrade(operation), handler_id);
                return (token, receiver);
            }
        }

        let operation = self.create_operation(request, options);
        let handler_id = operation.attach(sender);
        operations.insert(url.clone(), operation.clone());
        drop(operations);

        debug!(url = %url, id = operation.id(), ?options, "Queueing download");
        let token = DownloadToken::new(url.clone(), Arc::downgrade(&operation), handler_id);
        self.inner.queue.push(operation);
        (token, receiver)
    }

    fn prepare_request(&self, url: &Url, options: FetchOptions) -> TransportRequest {
        let headers = self.inner.headers.read().clone();
        let headers = match &self.inner.headers_filter {
            Some(filter) => filter(url, headers),
            None => headers,
        };
        build_request(url.clone(), options, &self.inner.config, headers)
    }

    fn create_operation(
        &self,
        request: TransportRequest,
        options: FetchOptions,
    ) -> Arc<FetchOperation> {
        let id = self.inner.next_operation_id.fetch_add(1, Ordering::Relaxed);

        let context = OperationContext {
            session: SessionHandle::Shared(self.inner.transport.clone()),
            codecs: self.inner.codecs.clone(),
            decompress_images: self.inner.config.decompress_images,
            events: self.inner.events.clone(),
            background: self.inner.background.clone(),
        };

        let weak: Weak<DownloaderInner> = Arc::downgrade(&self.inner);
        let finished_url = request.url.clone();
        let on_finished: FinishHook = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.operation_finished(&finished_url, id);
            }
        });

        FetchOperation::new(id, request, options, context, Some(on_finished))
    }

    /// Remove one registration; the transfer stops when its last registration is gone.
    pub fn cancel(&self, token: &DownloadToken) -> bool {
        token.cancel()
    }

    pub fn cancel_all_downloads(&self) {
        let operations: Vec<_> = self.inner.operations.lock().values().cloned().collect();
        debug!(count = operations.len(), "Cancelling all downloads");
        for operation in operations {
            operation.cancel_operation();
        }
    }

    /// Operations queued or running.
    pub fn current_download_count(&self) -> usize {
        self.inner.operations.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadLifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events as a stream. Events missed by a lagging consumer are skipped.
    pub fn lifecycle_stream(&self) -> impl Stream<Item = DownloadLifecycleEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move { event.ok() })
    }

    /// Suspended downloaders start nothing new; running transfers continue.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.queue.set_suspended(suspended);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.queue.is_suspended()
    }

    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.inner.queue.set_max_concurrent(max);
    }

    /// Set or clear a header sent with every new request.
    pub fn set_header(&self, name: HeaderName, value: Option<HeaderValue>) {
        let mut headers = self.inner.headers.write();
        match value {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.inner.headers.read().get(name).cloned()
    }
}

impl fmt::Debug for ImageDownloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDownloader")
            .field("operations", &self.current_download_count())
            .field("running", &self.inner.queue.running_count())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ImageDownloaderBuilder {
    config: Option<DownloaderConfig>,
    transport: Option<Arc<dyn Transport>>,
    codecs: Option<Arc<CodecChain>>,
    headers_filter: Option<HeadersFilter>,
    background: Option<Arc<dyn BackgroundTaskHost>>,
}

impl ImageDownloaderBuilder {
    pub fn with_config(mut self, config: DownloaderConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Send through `transport` instead of an HTTP transport built from the config.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecChain>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn with_headers_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Url, HeaderMap) -> HeaderMap + Send + Sync + 'static,
    {
        self.headers_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_background_host(mut self, host: Arc<dyn BackgroundTaskHost>) -> Self {
        self.background = Some(host);
        self
    }

    pub fn build(self) -> ImageDownloader {
        let config = self.config.unwrap_or_default();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(config.clone())));
        let codecs = self
            .codecs
            .unwrap_or_else(|| Arc::new(CodecChain::with_defaults()));
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        ImageDownloader {
            inner: Arc::new(DownloaderInner {
                queue: DownloadQueue::new(config.max_concurrent_downloads, config.execution_order),
                headers: RwLock::new(config.headers.clone()),
                config,
                transport,
                codecs,
                operations: Mutex::new(HashMap::new()),
                headers_filter: self.headers_filter,
                events,
                background: self.background,
                next_operation_id: AtomicU64::new(1),
            }),
        }
    }
}
