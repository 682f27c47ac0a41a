//! # Load Operation
//!
//! One logical request made through the manager. It owns the cancellation of
//! the cache lookup and of its download registration, and is the only path
//! results take back to the caller.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::ManagerInner;
use super::delivery::DeliveryQueue;
use crate::bitmap::Image;
use crate::cache::{CacheType, CachedImage};
use crate::cancel::Cancelable;
use crate::downloader::DownloadToken;
use crate::error::FetchError;

pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn(Completion) + Send + Sync>;

/// A successfully resolved image.
#[derive(Debug, Clone, Default)]
pub struct LoadedImage {
    /// `None` when nothing was cached and no download was allowed.
    pub image: Option<Image>,
    pub data: Option<Bytes>,
    pub cache_type: CacheType,
    /// A refresh found that the cached copy is still current.
    pub not_modified: bool,
}

impl LoadedImage {
    pub(crate) fn from_cache(cached: CachedImage) -> Self {
        Self {
            image: cached.image,
            data: cached.data,
            cache_type: cached.cache_type,
            not_modified: false,
        }
    }
}

/// Result of a load. A request produces exactly one completion with
/// `finished == true`, possibly preceded by interim ones (the cached image
/// before a refresh, progressive partial images).
#[derive(Debug, Clone)]
pub struct Completion {
    pub result: Result<LoadedImage, FetchError>,
    pub finished: bool,
    pub url: Option<Url>,
}

impl Completion {
    pub fn image(&self) -> Option<&Image> {
        self.result.as_ref().ok().and_then(|loaded| loaded.image.as_ref())
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.result.as_ref().ok().and_then(|loaded| loaded.data.as_ref())
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.result.as_ref().err()
    }

    pub fn cache_type(&self) -> CacheType {
        self.result
            .as_ref()
            .map(|loaded| loaded.cache_type)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub enum LoadEvent {
    Progress { received: u64, expected: Option<u64> },
    Completed(Completion),
}

#[derive(Clone)]
pub(crate) enum EventSink {
    Channel(mpsc::UnboundedSender<LoadEvent>),
    Callbacks {
        delivery: Arc<DeliveryQueue>,
        on_progress: Option<ProgressCallback>,
        on_complete: CompletionCallback,
    },
}

struct LoadState {
    cancelled: bool,
    sink: Option<EventSink>,
    cache_query: Option<CancellationToken>,
    download: Option<DownloadToken>,
}

pub struct LoadOperation {
    id: u64,
    url: Option<Url>,
    manager: Weak<ManagerInner>,
    state: Mutex<LoadState>,
}

impl LoadOperation {
    pub(crate) fn new(
        id: u64,
        url: Option<Url>,
        manager: Weak<ManagerInner>,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            url,
            manager,
            state: Mutex::new(LoadState {
                cancelled: false,
                sink: Some(sink),
                cache_query: None,
                download: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Stop the request. Nothing is delivered afterwards, including results that
    /// were already produced but not yet handed to a callback.
    pub fn cancel(&self) {
        let (cache_query, download) = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.sink = None;
            (state.cache_query.take(), state.download.take())
        };

        if let Some(token) = cache_query {
            token.cancel();
        }
        if let Some(token) = download {
            token.cancel();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_running(self.id);
        }
    }

    /// Returns `false` if the operation was cancelled first.
    pub(crate) fn set_cache_query(&self, token: CancellationToken) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        state.cache_query = Some(token);
        true
    }

    /// Returns `false` (and releases the registration) if the operation was
    /// cancelled first.
    pub(crate) fn set_download(&self, token: DownloadToken) -> bool {
        {
            let mut state = self.state.lock();
            if !state.cancelled {
                state.cache_query = None;
                state.download = Some(token);
                return true;
            }
        }
        token.cancel();
        false
    }

    pub(crate) fn progress(self: &Arc<Self>, received: u64, expected: Option<u64>) {
        self.emit(LoadEvent::Progress { received, expected }, false);
    }

    /// Deliver an interim result.
    pub(crate) fn deliver(self: &Arc<Self>, loaded: LoadedImage) {
        let completion = Completion {
            result: Ok(loaded),
            finished: false,
            url: self.url.clone(),
        };
        self.emit(LoadEvent::Completed(completion), false);
    }

    /// Leave the running set, then deliver the final result.
    pub(crate) fn complete(self: &Arc<Self>, result: Result<LoadedImage, FetchError>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_running(self.id);
        }
        self.state.lock().download = None;

        let completion = Completion {
            result,
            finished: true,
            url: self.url.clone(),
        };
        self.emit(LoadEvent::Completed(completion), true);
    }

    /// Drop the caller's channel without delivering anything; used once the
    /// manager itself is gone.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.cache_query = None;
        state.download = None;
    }

    fn emit(self: &Arc<Self>, event: LoadEvent, last: bool) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        let sink = if last {
            state.sink.take()
        } else {
            state.sink.clone()
        };

        match sink {
            Some(EventSink::Channel(sender)) => {
                let _ = sender.send(event);
            }
            Some(EventSink::Callbacks {
                delivery,
                on_progress,
                on_complete,
            }) => {
                drop(state);
                let operation = self.clone();
                delivery.post(Box::new(move || {
                    // Re-checked on the delivery task
                    if operation.is_cancelled() {
                        return;
                    }
                    match event {
                        LoadEvent::Progress { received, expected } => {
                            if let Some(on_progress) = on_progress {
                                on_progress(received, expected);
                            }
                        }
                        LoadEvent::Completed(completion) => on_complete(completion),
                    }
                }));
            }
            None => {}
        }
    }
}

impl Cancelable for LoadOperation {
    fn cancel(&self) {
        LoadOperation::cancel(self);
    }
}

impl fmt::Debug for LoadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOperation")
            .field("id", &self.id)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Receiving end of [`ImageManager::load`](super::ImageManager::load).
///
/// The stream ends after the final completion, or right away once the load is
/// cancelled. Dropping the handle does not cancel the load.
pub struct LoadHandle {
    operation: Arc<LoadOperation>,
    events: mpsc::UnboundedReceiver<LoadEvent>,
}

impl LoadHandle {
    pub(crate) fn new(
        operation: Arc<LoadOperation>,
        events: mpsc::UnboundedReceiver<LoadEvent>,
    ) -> Self {
        Self { operation, events }
    }

    pub fn operation(&self) -> &Arc<LoadOperation> {
        &self.operation
    }

    pub fn cancel(&self) {
        self.operation.cancel();
    }

    /// Wait for the final completion, skipping progress and interim results.
    /// `None` if the load was cancelled or abandoned.
    pub async fn finished(mut self) -> Option<Completion> {
        while let Some(event) = self.events.recv().await {
            if let LoadEvent::Completed(completion) = event {
                if completion.finished {
                    return Some(completion);
                }
            }
        }
        None
    }
}

impl Stream for LoadHandle {
    type Item = LoadEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
