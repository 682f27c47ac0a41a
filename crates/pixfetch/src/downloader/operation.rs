//! # Fetch Operation
//!
//! One network transfer for one URL, shared by every registration that asked
//! for that URL while it was in flight.
//!
//! State only moves forward: `Idle -> Executing -> Finished`, or `Idle -> Finished`
//! when cancelled before it was started. Both normal completion and cancellation
//! go through a single locked transition, so exactly one of them wins and the
//! `Stopped` lifecycle event is emitted once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::events::{DownloadEvent, DownloadLifecycleEvent, Downloaded};
use crate::bitmap::Image;
use crate::codec::{CodecChain, DecompressOptions, ProgressiveDecoder};
use crate::config::DownloaderConfig;
use crate::error::FetchError;
use crate::host::{BackgroundTaskHost, BackgroundTaskId};
use crate::options::FetchOptions;
use crate::transport::{HttpTransport, Transport, TransportRequest};

/// Upper bound for the initial body buffer reservation.
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// Prefix length after which a format no codec decodes progressively is given up on.
const PROGRESSIVE_SNIFF_LEN: usize = 64;

pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;

pub(crate) type FinishHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Executing,
    Finished,
}

/// The transport an operation sends through.
#[derive(Clone)]
pub enum SessionHandle {
    /// Owned by someone else; left untouched when the operation finishes.
    Shared(Arc<dyn Transport>),
    /// Created for this operation and released when it finishes.
    Owned(Arc<dyn Transport>),
}

impl SessionHandle {
    fn transport(&self) -> Arc<dyn Transport> {
        match self {
            SessionHandle::Shared(transport) | SessionHandle::Owned(transport) => {
                transport.clone()
            }
        }
    }
}

/// Settings an operation inherits from whoever creates it.
#[derive(Clone)]
pub(crate) struct OperationContext {
    pub session: SessionHandle,
    pub codecs: Arc<CodecChain>,
    pub decompress_images: bool,
    pub events: broadcast::Sender<DownloadLifecycleEvent>,
    pub background: Option<Arc<dyn BackgroundTaskHost>>,
}

struct Registration {
    id: u64,
    sender: EventSender,
}

struct OperationInner {
    state: OperationState,
    cancelled: bool,
    registrations: Vec<Registration>,
    next_handler_id: u64,
    background_task: Option<BackgroundTaskId>,
    on_finished: Option<FinishHook>,
}

pub struct FetchOperation {
    id: u64,
    request: TransportRequest,
    options: FetchOptions,
    codecs: Arc<CodecChain>,
    decompress_images: bool,
    events: broadcast::Sender<DownloadLifecycleEvent>,
    background: Option<Arc<dyn BackgroundTaskHost>>,
    session: Mutex<Option<SessionHandle>>,
    cancel_token: CancellationToken,
    inner: Mutex<OperationInner>,
}

impl FetchOperation {
    pub(crate) fn new(
        id: u64,
        request: TransportRequest,
        options: FetchOptions,
        context: OperationContext,
        on_finished: Option<FinishHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            request,
            options,
            codecs: context.codecs,
            decompress_images: context.decompress_images,
            events: context.events,
            background: context.background,
            session: Mutex::new(Some(context.session)),
            cancel_token: CancellationToken::new(),
            inner: Mutex::new(OperationInner {
                state: OperationState::Idle,
                cancelled: false,
                registrations: Vec::new(),
                next_handler_id: 1,
                background_task: None,
                on_finished,
            }),
        })
    }

    /// An operation outside any downloader. It builds its own HTTP transport from
    /// `config` and drops it once finished.
    pub fn standalone(
        url: Url,
        options: FetchOptions,
        config: &DownloaderConfig,
        codecs: Arc<CodecChain>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let request = super::build_request(url, options, config, config.headers.clone());
        let context = OperationContext {
            session: SessionHandle::Owned(Arc::new(HttpTransport::new(config.clone()))),
            codecs,
            decompress_images: config.decompress_images,
            events,
            background: None,
        };
        Self::new(0, request, options, context, None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn request(&self) -> &TransportRequest {
        &self.request
    }

    pub fn options(&self) -> FetchOptions {
        self.options
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == OperationState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Whether the operation still holds its transport session.
    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadLifecycleEvent> {
        self.events.subscribe()
    }

    /// Register another receiver. Returns `None` once the operation is finished or
    /// cancelled; the caller should create a new operation instead.
    pub fn add_handler(&self, sender: EventSender) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.cancelled || inner.state == OperationState::Finished {
            return None;
        }
        Some(Self::push_registration(&mut inner, sender))
    }

    /// Register on a freshly created operation.
    pub(crate) fn attach(&self, sender: EventSender) -> u64 {
        Self::push_registration(&mut self.inner.lock(), sender)
    }

    fn push_registration(inner: &mut OperationInner, sender: EventSender) -> u64 {
        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.registrations.push(Registration { id, sender });
        id
    }

    pub fn registration_count(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    /// Remove one registration. The transfer itself is cancelled when the last
    /// registration goes away; returns whether that happened.
    pub fn cancel(&self, handler_id: u64) -> bool {
        let should_cancel = {
            let mut inner = self.inner.lock();
            let before = inner.registrations.len();
            inner.registrations.retain(|r| r.id != handler_id);
            inner.registrations.len() != before && inner.registrations.is_empty()
        };

        if should_cancel {
            self.terminate(None);
        }
        should_cancel
    }

    /// Cancel the whole transfer regardless of how many registrations remain.
    /// Remaining receivers see their channel close without a `Finished` event.
    pub fn cancel_operation(&self) {
        self.terminate(None);
    }

    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                OperationState::Idle => inner.state = OperationState::Executing,
                OperationState::Executing => return,
                OperationState::Finished => {
                    debug!(id = self.id, url = %self.request.url, "Skipping start of cancelled download");
                    return;
                }
            }
        }

        if self.options.contains(FetchOptions::CONTINUE_IN_BACKGROUND) {
            self.begin_background_task();
        }

        self.deliver(DownloadEvent::Progress {
            received: 0,
            expected: None,
        });
        self.emit(DownloadLifecycleEvent::Started {
            id: self.id,
            url: self.request.url.clone(),
        });

        tokio::spawn(self.clone().run());
    }

    fn begin_background_task(self: &Arc<Self>) {
        let Some(host) = &self.background else {
            return;
        };

        let weak = Arc::downgrade(self);
        let grant = host.begin(Box::new(move || {
            if let Some(operation) = weak.upgrade() {
                warn!(url = %operation.request.url, "Background grant expired, cancelling download");
                operation.terminate(Some(FetchError::Cancelled));
            }
        }));

        let mut inner = self.inner.lock();
        if inner.state == OperationState::Finished {
            drop(inner);
            if let Some(id) = grant {
                host.end(id);
            }
        } else {
            inner.background_task = grant;
        }
    }

    #[instrument(skip(self), fields(id = self.id, url = %self.request.url), level = "debug")]
    async fn run(self: Arc<Self>) {
        let cancel_token = self.cancel_token.clone();
        let result = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Transfer cancelled");
                return;
            }
            result = self.transfer() => result,
        };
        self.complete(result);
    }

    async fn transfer(self: &Arc<Self>) -> Result<Downloaded, FetchError> {
        let transport = self
            .session
            .lock()
            .as_ref()
            .map(SessionHandle::transport)
            .ok_or_else(|| FetchError::TaskInit("transport session was released".to_string()))?;

        let cached = if self.options.contains(FetchOptions::IGNORE_CACHED_RESPONSE) {
            transport.cached_response(&self.request).await
        } else {
            None
        };

        let response = transport.send(&self.request).await?;
        let status = response.status;

        // A 304 only makes sense when there is a cached body to fall back to
        if status >= 400 || (status == 304 && cached.is_none()) {
            debug!(status, "Rejecting response");
            return Err(FetchError::InvalidResponse { status });
        }

        self.emit(DownloadLifecycleEvent::ResponseReceived {
            id: self.id,
            url: self.request.url.clone(),
            status,
        });

        let expected = response.expected_length.filter(|len| *len > 0);
        self.deliver(DownloadEvent::Progress {
            received: 0,
            expected,
        });

        let worker = DecodeWorker::spawn(self.clone());
        let progressive = self.options.contains(FetchOptions::PROGRESSIVE_DOWNLOAD);
        let mut buffer =
            BytesMut::with_capacity(expected.unwrap_or(0).min(MAX_PREALLOCATION) as usize);

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            let received = buffer.len() as u64;

            if let (true, Some(total)) = (progressive, expected) {
                worker.submit_partial(&buffer, received >= total);
            }

            self.deliver(DownloadEvent::Progress { received, expected });
        }

        let mut data = buffer.freeze();
        if data.is_empty() && status == 304 {
            data = cached.clone().unwrap_or_default();
        }

        if data.is_empty() {
            return Err(FetchError::Decode("image data is empty".to_string()));
        }

        if self.options.contains(FetchOptions::IGNORE_CACHED_RESPONSE)
            && cached.as_ref() == Some(&data)
        {
            debug!("Response matches cached body, reporting not modified");
            return Ok(Downloaded::default());
        }

        let image = worker.finish(data.clone()).await?;
        debug!(
            width = image.width(),
            height = image.height(),
            bytes = data.len(),
            "Download decoded"
        );

        Ok(Downloaded {
            image: Some(image),
            data: Some(data),
        })
    }

    /// Executing -> Finished after the transfer ran to an end.
    fn complete(&self, result: Result<Downloaded, FetchError>) {
        let registrations = {
            let mut inner = self.inner.lock();
            if inner.state != OperationState::Executing {
                return;
            }
            inner.state = OperationState::Finished;
            std::mem::take(&mut inner.registrations)
        };

        self.emit(DownloadLifecycleEvent::Stopped {
            id: self.id,
            url: self.request.url.clone(),
        });
        match &result {
            Ok(_) => self.emit(DownloadLifecycleEvent::Finished {
                id: self.id,
                url: self.request.url.clone(),
            }),
            Err(e) => debug!(id = self.id, url = %self.request.url, error = %e, "Download failed"),
        }

        for registration in &registrations {
            let _ = registration
                .sender
                .send(DownloadEvent::Finished(result.clone()));
        }

        // Receivers see their channel close only after the operation is released
        self.done();
        drop(registrations);
    }

    /// Cancel from any live state. With an error, remaining registrations receive it
    /// as their final event; without one their channels simply close.
    pub(crate) fn terminate(&self, error: Option<FetchError>) {
        let (registrations, was_executing) = {
            let mut inner = self.inner.lock();
            if inner.state == OperationState::Finished {
                return;
            }
            inner.cancelled = true;
            let was_executing = inner.state == OperationState::Executing;
            inner.state = OperationState::Finished;
            (std::mem::take(&mut inner.registrations), was_executing)
        };

        self.cancel_token.cancel();
        debug!(id = self.id, url = %self.request.url, "Download cancelled");

        if was_executing {
            self.emit(DownloadLifecycleEvent::Stopped {
                id: self.id,
                url: self.request.url.clone(),
            });
        }

        if let Some(error) = error {
            for registration in &registrations {
                let _ = registration
                    .sender
                    .send(DownloadEvent::Finished(Err(error.clone())));
            }
        }

        self.done();
        drop(registrations);
    }

    /// Release everything the operation holds. Runs once, after the transition to Finished.
    fn done(&self) {
        let (background_task, on_finished) = {
            let mut inner = self.inner.lock();
            (inner.background_task.take(), inner.on_finished.take())
        };

        if let (Some(id), Some(host)) = (background_task, &self.background) {
            host.end(id);
        }

        {
            let mut session = self.session.lock();
            if matches!(*session, Some(SessionHandle::Owned(_))) {
                *session = None;
            }
        }

        if let Some(on_finished) = on_finished {
            on_finished();
        }
    }

    /// Send an event to every registration while executing. Channel sends never
    /// block, and holding the lock keeps removed registrations from seeing later events.
    fn deliver(&self, event: DownloadEvent) {
        let inner = self.inner.lock();
        if inner.state != OperationState::Executing {
            return;
        }
        for registration in &inner.registrations {
            let _ = registration.sender.send(event.clone());
        }
    }

    fn emit(&self, event: DownloadLifecycleEvent) {
        let _ = self.events.send(event);
    }

    fn decode_settings(&self) -> (Arc<CodecChain>, DecodeSettings) {
        (
            self.codecs.clone(),
            DecodeSettings {
                decompress: self.decompress_images,
                scale_down: self.options.contains(FetchOptions::SCALE_DOWN_LARGE_IMAGES),
            },
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct DecodeSettings {
    decompress: bool,
    scale_down: bool,
}

impl DecodeSettings {
    fn prepare(self, codecs: &CodecChain, image: Image, data: &[u8]) -> Image {
        if !self.decompress || image.is_animated() {
            return image;
        }
        codecs.decompress(
            image,
            data,
            DecompressOptions {
                scale_down: self.scale_down,
            },
        )
    }
}

enum DecodeJob {
    Partial {
        data: Bytes,
        finished: bool,
    },
    Final {
        data: Bytes,
        reply: oneshot::Sender<Result<Image, FetchError>>,
    },
}

/// Admission for partial decode jobs. At most one copied prefix waits in the
/// queue, and none are copied once the data was rejected for progressive decoding.
#[derive(Default)]
struct PartialGate {
    queued: AtomicBool,
    rejected: AtomicBool,
}

/// Serial decode queue of one operation. Jobs run on the blocking pool one at a
/// time, so partial images always reach registrations before the final result.
struct DecodeWorker {
    jobs: mpsc::UnboundedSender<DecodeJob>,
    gate: Arc<PartialGate>,
}

impl DecodeWorker {
    fn spawn(operation: Arc<FetchOperation>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(PartialGate::default());
        tokio::spawn(run_decode_worker(operation, gate.clone(), rx));
        Self { jobs, gate }
    }

    /// Queue the accumulated prefix unless a previous one is still waiting.
    fn submit_partial(&self, buffer: &[u8], finished: bool) {
        if self.gate.rejected.load(Ordering::Acquire) || self.gate.queued.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let data = Bytes::copy_from_slice(buffer);
        if self.jobs.send(DecodeJob::Partial { data, finished }).is_err() {
            self.gate.queued.store(false, Ordering::Release);
        }
    }

    async fn finish(&self, data: Bytes) -> Result<Image, FetchError> {
        let stopped = || FetchError::Decode("decode worker stopped".to_string());
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(DecodeJob::Final { data, reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

async fn run_decode_worker(
    operation: Arc<FetchOperation>,
    gate: Arc<PartialGate>,
    mut rx: mpsc::UnboundedReceiver<DecodeJob>,
) {
    let (codecs, settings) = operation.decode_settings();
    let mut decoder: Option<Box<dyn ProgressiveDecoder>> = None;
    let mut pending: Option<DecodeJob> = None;

    loop {
        let job = match pending.take() {
            Some(job) => job,
            None => match rx.recv().await {
                Some(job) => job,
                None => break,
            },
        };

        match job {
            DecodeJob::Partial { data, finished } => {
                gate.queued.store(false, Ordering::Release);
                // A newer job is already waiting; this prefix is stale
                if let Ok(next) = rx.try_recv() {
                    pending = Some(next);
                    continue;
                }
                let prefix_len = data.len();

                let codecs = codecs.clone();
                let state = decoder.take();
                let outcome = tokio::task::spawn_blocking(move || {
                    decode_partial(&codecs, settings, state, &data, finished)
                })
                .await;

                match outcome {
                    Ok((state, image)) => {
                        if state.is_none() && prefix_len >= PROGRESSIVE_SNIFF_LEN {
                            debug!(bytes = prefix_len, "No progressive decoder for data");
                            gate.rejected.store(true, Ordering::Release);
                        }
                        decoder = state;
                        if let Some(image) = image {
                            operation.deliver(DownloadEvent::Partial(image));
                        }
                    }
                    Err(e) => warn!(error = %e, "Progressive decode task failed"),
                }
            }
            DecodeJob::Final { data, reply } => {
                let codecs = codecs.clone();
                let result = tokio::task::spawn_blocking(move || {
                    decode_final(&codecs, settings, &data)
                })
                .await
                .unwrap_or_else(|e| Err(FetchError::Decode(format!("decode task failed: {e}"))));
                let _ = reply.send(result);
            }
        }
    }
}

/// Feed the accumulated prefix to the operation's incremental decoder, choosing
/// the decoder on the first prefix a codec accepts.
fn decode_partial(
    codecs: &CodecChain,
    settings: DecodeSettings,
    state: Option<Box<dyn ProgressiveDecoder>>,
    data: &[u8],
    finished: bool,
) -> (Option<Box<dyn ProgressiveDecoder>>, Option<Image>) {
    let mut state = state.or_else(|| {
        codecs
            .progressive_decoder(data)
            .filter(|decoder| decoder.can_incrementally_decode(data))
    });

    let image = state
        .as_mut()
        .and_then(|decoder| decoder.incremental_decode(data, finished))
        .filter(|image| !image.is_empty())
        .map(|image| settings.prepare(codecs, image, data));

    (state, image)
}

fn decode_final(
    codecs: &CodecChain,
    settings: DecodeSettings,
    data: &[u8],
) -> Result<Image, FetchError> {
    let image = codecs
        .decode(data)
        .map_err(|e| FetchError::Decode(e.to_string()))?;

    if image.is_empty() {
        return Err(FetchError::Decode(
            "downloaded image has zero pixels".to_string(),
        ));
    }

    Ok(settings.prepare(codecs, image, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_utils::{MockRoute, MockTransport, TestCodec, init_tracing, test_image_bytes};
    use crate::transport::TransportErrorKind;

    const URL: &str = "http://x/a.png";

    fn codecs() -> Arc<CodecChain> {
        let chain = CodecChain::new();
        chain.add_codec(Arc::new(TestCodec::default()));
        Arc::new(chain)
    }

    fn operation(
        transport: Arc<MockTransport>,
        options: FetchOptions,
        background: Option<Arc<dyn BackgroundTaskHost>>,
    ) -> (Arc<FetchOperation>, broadcast::Receiver<DownloadLifecycleEvent>) {
        operation_with_codecs(transport, options, background, codecs())
    }

    fn operation_with_codecs(
        transport: Arc<MockTransport>,
        options: FetchOptions,
        background: Option<Arc<dyn BackgroundTaskHost>>,
        codecs: Arc<CodecChain>,
    ) -> (Arc<FetchOperation>, broadcast::Receiver<DownloadLifecycleEvent>) {
        let (events, rx) = broadcast::channel(64);
        let context = OperationContext {
            session: SessionHandle::Shared(transport),
            codecs,
            decompress_images: true,
            events,
            background,
        };
        let request = TransportRequest::new(Url::parse(URL).unwrap());
        (FetchOperation::new(1, request, options, context, None), rx)
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn final_result(events: &[DownloadEvent]) -> &Result<Downloaded, FetchError> {
        match events.last() {
            Some(DownloadEvent::Finished(result)) => result,
            other => panic!("expected a final event, got {other:?}"),
        }
    }

    fn lifecycle(rx: &mut broadcast::Receiver<DownloadLifecycleEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event {
                DownloadLifecycleEvent::Started { .. } => "started",
                DownloadLifecycleEvent::ResponseReceived { .. } => "response",
                DownloadLifecycleEvent::Stopped { .. } => "stopped",
                DownloadLifecycleEvent::Finished { .. } => "finished",
            });
        }
        names
    }

    #[tokio::test]
    async fn test_successful_transfer() {
        init_tracing();
        let transport = MockTransport::new();
        let data = test_image_bytes(3, 2, 1);
        transport.route(URL, MockRoute::ok(data.clone()));

        let (op, mut lifecycle_rx) = operation(transport.clone(), FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        assert!(matches!(
            events.first(),
            Some(DownloadEvent::Progress {
                received: 0,
                expected: None
            })
        ));
        let downloaded = final_result(&events).as_ref().unwrap();
        assert_eq!(downloaded.data.as_ref(), Some(&data));
        assert_eq!(downloaded.image.as_ref().unwrap().width(), 3);

        assert_eq!(op.state(), OperationState::Finished);
        assert_eq!(transport.send_count(), 1);
        assert_eq!(
            lifecycle(&mut lifecycle_rx),
            vec!["started", "response", "stopped", "finished"]
        );
    }

    #[tokio::test]
    async fn test_error_statuses_are_invalid() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::status(404));

        let (op, mut lifecycle_rx) = operation(transport, FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        assert!(matches!(
            final_result(&events),
            Err(FetchError::InvalidResponse { status: 404 })
        ));
        assert_eq!(lifecycle(&mut lifecycle_rx), vec!["started", "stopped"]);
    }

    #[tokio::test]
    async fn test_not_modified_without_cached_body_is_invalid() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::status(304));

        let (op, _) = operation(transport, FetchOptions::IGNORE_CACHED_RESPONSE, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        assert!(matches!(
            final_result(&events),
            Err(FetchError::InvalidResponse { status: 304 })
        ));
    }

    #[tokio::test]
    async fn test_not_modified_with_cached_body() {
        let transport = MockTransport::new();
        let data = test_image_bytes(2, 2, 1);
        transport.route(URL, MockRoute::status(304));
        transport.set_cached(URL, data);

        let (op, _) = operation(transport, FetchOptions::IGNORE_CACHED_RESPONSE, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        assert!(final_result(&events).as_ref().unwrap().is_not_modified());
    }

    #[tokio::test]
    async fn test_changed_body_is_decoded_despite_cache() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::ok(test_image_bytes(5, 5, 1)));
        transport.set_cached(URL, test_image_bytes(2, 2, 1));

        let (op, _) = operation(transport, FetchOptions::IGNORE_CACHED_RESPONSE, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        let downloaded = final_result(&events).as_ref().unwrap();
        assert_eq!(downloaded.image.as_ref().unwrap().width(), 5);
    }

    #[tokio::test]
    async fn test_zero_dimensions_and_empty_body_fail_to_decode() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::ok(test_image_bytes(0, 7, 1)));
        transport.route("http://x/empty.png", MockRoute::ok(Bytes::new()));

        let (op, _) = operation(transport.clone(), FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();
        let events = collect(rx).await;
        assert!(events
            .iter()
            .all(|event| !matches!(event, DownloadEvent::Partial(_))));
        assert!(matches!(final_result(&events), Err(FetchError::Decode(_))));

        let (events_tx, _) = broadcast::channel(4);
        let context = OperationContext {
            session: SessionHandle::Shared(transport),
            codecs: codecs(),
            decompress_images: true,
            events: events_tx,
            background: None,
        };
        let request = TransportRequest::new(Url::parse("http://x/empty.png").unwrap());
        let op = FetchOperation::new(2, request, FetchOptions::empty(), context, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();
        let events = collect(rx).await;
        match final_result(&events) {
            Err(FetchError::Decode(message)) => assert_eq!(message, "image data is empty"),
            other => panic!("expected an empty-data error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_errors_are_delivered() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::failing(TransportErrorKind::CannotFindHost));

        let (op, _) = operation(transport, FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        match final_result(&events) {
            Err(e @ FetchError::Transport(_)) => assert!(e.is_transient()),
            other => panic!("expected a transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_task_init_failure_is_reported_as_task_init() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::failing(TransportErrorKind::TaskInit));

        let (op, _) = operation(transport, FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        match final_result(&events) {
            Err(e @ FetchError::TaskInit(_)) => assert!(!e.is_transient()),
            other => panic!("expected a task init error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progressive_partials_precede_final() {
        let transport = MockTransport::new();
        let data = test_image_bytes(8, 8, 1);
        let chunks: Vec<Bytes> = data.chunks(16).map(Bytes::copy_from_slice).collect();
        transport.route(
            URL,
            MockRoute::chunked(chunks, Duration::from_millis(5)),
        );

        let (op, _) = operation(transport, FetchOptions::PROGRESSIVE_DOWNLOAD, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        let partials: Vec<&Image> = events
            .iter()
            .filter_map(|event| match event {
                DownloadEvent::Partial(image) => Some(image),
                _ => None,
            })
            .collect();
        assert!(!partials.is_empty());

        let last_partial = events
            .iter()
            .rposition(|event| matches!(event, DownloadEvent::Partial(_)))
            .unwrap();
        assert!(last_partial < events.len() - 1);

        let final_image = final_result(&events)
            .as_ref()
            .unwrap()
            .image
            .clone()
            .unwrap();
        assert!(partials.iter().all(|partial| !partial.ptr_eq(&final_image)));

        let progress_total = events
            .iter()
            .filter_map(|event| match event {
                DownloadEvent::Progress { received, .. } => Some(*received),
                _ => None,
            })
            .max();
        assert_eq!(progress_total, Some(data.len() as u64));
    }

    fn non_progressive_codecs() -> Arc<CodecChain> {
        let chain = CodecChain::new();
        chain.add_codec(Arc::new(TestCodec::without_progressive()));
        Arc::new(chain)
    }

    #[tokio::test]
    async fn test_progressive_without_incremental_codec_yields_no_partials() {
        let transport = MockTransport::new();
        let data = test_image_bytes(16, 16, 1);
        let chunks: Vec<Bytes> = data.chunks(16).map(Bytes::copy_from_slice).collect();
        transport.route(URL, MockRoute::chunked(chunks, Duration::from_millis(2)));

        let (op, _) = operation_with_codecs(
            transport,
            FetchOptions::PROGRESSIVE_DOWNLOAD,
            None,
            non_progressive_codecs(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();

        let events = collect(rx).await;
        assert!(!events.iter().any(|event| matches!(event, DownloadEvent::Partial(_))));
        let image = final_result(&events).as_ref().unwrap().image.clone().unwrap();
        assert_eq!((image.width(), image.height()), (16, 16));
    }

    #[tokio::test]
    async fn test_rejected_prefix_stops_partial_submissions() {
        let transport = MockTransport::new();
        let (op, _) = operation_with_codecs(
            transport,
            FetchOptions::PROGRESSIVE_DOWNLOAD,
            None,
            non_progressive_codecs(),
        );
        let data = test_image_bytes(16, 16, 1);
        let worker = DecodeWorker::spawn(op);

        worker.submit_partial(&data[..PROGRESSIVE_SNIFF_LEN], false);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !worker.gate.rejected.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("prefix should be rejected");

        worker.submit_partial(&data[..128], false);
        assert!(!worker.gate.queued.load(Ordering::Acquire));

        let image = worker.finish(data.clone()).await.unwrap();
        assert_eq!(image.width(), 16);
    }

    #[tokio::test]
    async fn test_non_last_cancel_keeps_transfer_running() {
        let transport = MockTransport::new();
        transport.route(
            URL,
            MockRoute::ok(test_image_bytes(2, 2, 1)).with_delay(Duration::from_millis(50)),
        );

        let (op, _) = operation(transport, FetchOptions::empty(), None);
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = op.add_handler(tx_a).unwrap();
        op.add_handler(tx_b).unwrap();
        op.start();

        assert!(!op.cancel(a));
        assert!(!op.is_cancelled());

        let cancelled = collect(rx_a).await;
        assert!(cancelled
            .iter()
            .all(|event| !matches!(event, DownloadEvent::Finished(_))));

        let events = collect(rx_b).await;
        assert!(final_result(&events).is_ok());
    }

    #[tokio::test]
    async fn test_last_cancel_stops_transfer_once() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::hanging());

        let (op, mut lifecycle_rx) = operation(transport.clone(), FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = op.add_handler(tx).unwrap();
        op.start();
        tokio::task::yield_now().await;

        assert!(op.cancel(handler));
        assert!(op.is_cancelled());
        assert_eq!(op.state(), OperationState::Finished);

        let events = collect(rx).await;
        assert!(events
            .iter()
            .all(|event| !matches!(event, DownloadEvent::Finished(_))));

        // Second cancel and late handlers are rejected
        op.cancel_operation();
        let (late, _late_rx) = mpsc::unbounded_channel();
        assert!(op.add_handler(late).is_none());

        assert_eq!(lifecycle(&mut lifecycle_rx), vec!["started", "stopped"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_never_sends() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::ok(test_image_bytes(2, 2, 1)));

        let (op, mut lifecycle_rx) = operation(transport.clone(), FetchOptions::empty(), None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = op.add_handler(tx).unwrap();

        assert!(op.cancel(handler));
        op.start();
        tokio::task::yield_now().await;

        assert_eq!(op.state(), OperationState::Finished);
        assert_eq!(transport.send_count(), 0);
        assert!(lifecycle(&mut lifecycle_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_expiry_cancels_with_error() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::hanging());
        let host = Arc::new(crate::host::DeadlineHost::new(Duration::from_secs(10)));

        let (op, _) = operation(
            transport,
            FetchOptions::CONTINUE_IN_BACKGROUND,
            Some(host.clone()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();
        assert_eq!(host.active_grants(), 1);

        let events = collect(rx).await;
        assert!(matches!(final_result(&events), Err(FetchError::Cancelled)));
        assert!(op.is_cancelled());
        assert_eq!(host.active_grants(), 0);
    }

    #[tokio::test]
    async fn test_owned_session_is_released() {
        let transport = MockTransport::new();
        transport.route(URL, MockRoute::ok(test_image_bytes(1, 1, 1)));

        let (events, _) = broadcast::channel(4);
        let context = OperationContext {
            session: SessionHandle::Owned(transport.clone()),
            codecs: codecs(),
            decompress_images: false,
            events,
            background: None,
        };
        let request = TransportRequest::new(Url::parse(URL).unwrap());
        let op = FetchOperation::new(3, request, FetchOptions::empty(), context, None);
        let (tx, rx) = mpsc::unbounded_channel();
        op.add_handler(tx).unwrap();
        op.start();
        collect(rx).await;

        assert!(!op.has_session());

        let (shared_op, _) = operation(transport, FetchOptions::empty(), None);
        let (tx, rx) = mpsc::unbounded_channel();
        shared_op.add_handler(tx).unwrap();
        shared_op.start();
        collect(rx).await;
        assert!(shared_op.has_session());
    }
}
