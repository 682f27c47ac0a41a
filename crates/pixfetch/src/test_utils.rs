//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;

use crate::bitmap::{Image, ImageFormat};
use crate::codec::{CodecError, ImageCodec, ProgressiveDecoder};
use crate::transport::{
    Transport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Canned answer for one URL.
#[derive(Debug, Clone)]
pub(crate) struct MockRoute {
    status: u16,
    chunks: Vec<Bytes>,
    chunk_delay: Duration,
    response_delay: Duration,
    hang: bool,
    error: Option<TransportErrorKind>,
}

impl MockRoute {
    pub fn ok(body: Bytes) -> Self {
        Self::chunked(vec![body], Duration::ZERO)
    }

    pub fn chunked(chunks: Vec<Bytes>, chunk_delay: Duration) -> Self {
        Self {
            status: 200,
            chunks,
            chunk_delay,
            response_delay: Duration::ZERO,
            hang: false,
            error: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::chunked(Vec::new(), Duration::ZERO)
        }
    }

    /// Response headers never arrive.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::status(200)
        }
    }

    pub fn failing(kind: TransportErrorKind) -> Self {
        Self {
            error: Some(kind),
            ..Self::status(200)
        }
    }

    /// Delay before the response headers arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }
}

/// In-memory transport with per-URL routes. Unknown URLs answer 404.
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<String, MockRoute>>,
    cached: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<TransportRequest>>,
    sends: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, route: MockRoute) {
        self.routes.lock().insert(url.to_string(), route);
    }

    /// Body reported by `cached_response` for `url`.
    pub fn set_cached(&self, url: &str, body: Bytes) {
        self.cached.lock().insert(url.to_string(), body);
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let route = self
            .routes
            .lock()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| MockRoute::status(404));

        if !route.response_delay.is_zero() {
            tokio::time::sleep(route.response_delay).await;
        }
        if route.hang {
            return std::future::pending().await;
        }
        if let Some(kind) = route.error {
            return Err(TransportError::new(kind, "mock failure"));
        }

        let expected_length = route.chunks.iter().map(|c| c.len() as u64).sum();
        let delay = route.chunk_delay;
        let body = stream::iter(route.chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, TransportError>(chunk)
            })
            .boxed();

        Ok(TransportResponse {
            status: route.status,
            headers: HeaderMap::new(),
            expected_length: Some(expected_length),
            body,
        })
    }

    async fn cached_response(&self, request: &TransportRequest) -> Option<Bytes> {
        self.cached.lock().get(request.url.as_str()).cloned()
    }
}

const TEST_MAGIC: &[u8; 4] = b"TIMG";
const TEST_HEADER_LEN: usize = 9;

/// Bytes in the test codec's format: magic, width and height as u16 LE, frame
/// count, then one payload byte per pixel.
pub(crate) fn test_image_bytes(width: u16, height: u16, frames: u8) -> Bytes {
    let payload = usize::from(width) * usize::from(height);
    let mut buf = BytesMut::with_capacity(TEST_HEADER_LEN + payload);
    buf.put_slice(TEST_MAGIC);
    buf.put_u16_le(width);
    buf.put_u16_le(height);
    buf.put_u8(frames);
    buf.put_bytes(0xAB, payload);
    buf.freeze()
}

fn parse_header(data: &[u8]) -> Option<(u32, u32, u32)> {
    if data.len() < TEST_HEADER_LEN || &data[..4] != TEST_MAGIC {
        return None;
    }
    let width = u16::from_le_bytes([data[4], data[5]]);
    let height = u16::from_le_bytes([data[6], data[7]]);
    Some((u32::from(width), u32::from(height), u32::from(data[8])))
}

fn opaque_image(width: u32, height: u32, frames: u32) -> Image {
    Image::from_rgba(width, height, vec![0xFFu8; (width * height * 4) as usize])
        .with_frame_count(frames)
}

/// Deterministic codec for the `TIMG` test format.
pub(crate) struct TestCodec {
    progressive: bool,
}

impl Default for TestCodec {
    fn default() -> Self {
        Self { progressive: true }
    }
}

impl TestCodec {
    pub fn without_progressive() -> Self {
        Self { progressive: false }
    }
}

impl ImageCodec for TestCodec {
    fn name(&self) -> &'static str {
        "test"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        data.starts_with(TEST_MAGIC)
    }

    fn decode(&self, data: &[u8]) -> Result<Image, CodecError> {
        let (width, height, frames) =
            parse_header(data).ok_or_else(|| CodecError::Decode("truncated header".into()))?;
        if data.len() < TEST_HEADER_LEN + (width * height) as usize {
            return Err(CodecError::Decode("truncated payload".into()));
        }
        Ok(opaque_image(width, height, frames))
    }

    fn progressive_decoder(&self, data: &[u8]) -> Option<Box<dyn ProgressiveDecoder>> {
        (self.progressive && self.can_decode(data))
            .then(|| Box::new(TestProgressiveDecoder) as Box<dyn ProgressiveDecoder>)
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        format != ImageFormat::Heic
    }

    fn encode(&self, image: &Image, _format: ImageFormat) -> Result<Bytes, CodecError> {
        let width = u16::try_from(image.width()).map_err(|e| CodecError::Encode(e.to_string()))?;
        let height =
            u16::try_from(image.height()).map_err(|e| CodecError::Encode(e.to_string()))?;
        let frames = u8::try_from(image.frame_count()).unwrap_or(u8::MAX);
        Ok(test_image_bytes(width, height, frames))
    }
}

/// Yields a fresh image every time the header is complete and some payload arrived.
struct TestProgressiveDecoder;

impl ProgressiveDecoder for TestProgressiveDecoder {
    fn can_incrementally_decode(&self, data: &[u8]) -> bool {
        data.starts_with(TEST_MAGIC)
    }

    fn incremental_decode(&mut self, data: &[u8], _finished: bool) -> Option<Image> {
        let (width, height, frames) = parse_header(data)?;
        (data.len() > TEST_HEADER_LEN).then(|| opaque_image(width, height, frames))
    }
}

/// A PNG of `width` x `height` filled with `rgba`.
pub(crate) fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Bytes {
    let buffer = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    buffer
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png fixture");
    Bytes::from(out.into_inner())
}
