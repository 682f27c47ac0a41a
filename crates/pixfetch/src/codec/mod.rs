//! # Codecs
//!
//! Format handlers used to turn downloaded bytes into [`Image`]s and back.
//! Handlers are consulted through a [`CodecChain`]; the most recently added
//! handler gets the first chance to claim a buffer.

mod raster;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::bitmap::{Image, ImageFormat};

pub use raster::{MAX_DECODED_PIXELS, RasterCodec};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("No codec can handle this data")]
    Unsupported,
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Failed to encode image: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecompressOptions {
    /// Scale images above the pixel budget down before handing them out.
    pub scale_down: bool,
}

/// A format handler.
pub trait ImageCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_decode(&self, data: &[u8]) -> bool;

    fn decode(&self, data: &[u8]) -> Result<Image, CodecError>;

    /// A fresh incremental decoder if this codec can parse `data` progressively.
    fn progressive_decoder(&self, _data: &[u8]) -> Option<Box<dyn ProgressiveDecoder>> {
        None
    }

    /// Prepare a decoded image for display. Codecs may return the image untouched
    /// for formats they treat as exempt.
    fn decompress(&self, image: Image, _data: &[u8], _options: DecompressOptions) -> Image {
        image
    }

    fn can_encode(&self, format: ImageFormat) -> bool;

    fn encode(&self, image: &Image, format: ImageFormat) -> Result<Bytes, CodecError>;
}

/// Stateful decoder fed with an ever-growing prefix of one resource.
pub trait ProgressiveDecoder: Send {
    fn can_incrementally_decode(&self, data: &[u8]) -> bool;

    /// Decode the accumulated bytes; `None` until enough data is available.
    fn incremental_decode(&mut self, data: &[u8], finished: bool) -> Option<Image>;
}

/// Ordered set of codecs.
pub struct CodecChain {
    codecs: RwLock<Vec<Arc<dyn ImageCodec>>>,
}

impl CodecChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
        }
    }

    /// A chain holding the built-in raster codec.
    pub fn with_defaults() -> Self {
        let chain = Self::new();
        chain.add_codec(Arc::new(RasterCodec::new()));
        chain
    }

    /// Add a codec; it takes priority over every codec added before it.
    pub fn add_codec(&self, codec: Arc<dyn ImageCodec>) {
        self.codecs.write().push(codec);
    }

    pub fn remove_codec(&self, name: &str) -> bool {
        let mut codecs = self.codecs.write();
        let before = codecs.len();
        codecs.retain(|codec| codec.name() != name);
        codecs.len() != before
    }

    pub fn codec_names(&self) -> Vec<&'static str> {
        self.ordered().iter().map(|codec| codec.name()).collect()
    }

    fn ordered(&self) -> Vec<Arc<dyn ImageCodec>> {
        self.codecs.read().iter().rev().cloned().collect()
    }

    fn find_decoder(&self, data: &[u8]) -> Option<Arc<dyn ImageCodec>> {
        self.ordered()
            .into_iter()
            .find(|codec| codec.can_decode(data))
    }

    pub fn can_decode(&self, data: &[u8]) -> bool {
        self.find_decoder(data).is_some()
    }

    pub fn decode(&self, data: &[u8]) -> Result<Image, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Decode("image data is empty".to_string()));
        }
        let codec = self.find_decoder(data).ok_or(CodecError::Unsupported)?;
        codec.decode(data)
    }

    pub fn progressive_decoder(&self, data: &[u8]) -> Option<Box<dyn ProgressiveDecoder>> {
        self.ordered()
            .into_iter()
            .find_map(|codec| codec.progressive_decoder(data))
    }

    pub fn decompress(&self, image: Image, data: &[u8], options: DecompressOptions) -> Image {
        match self.find_decoder(data) {
            Some(codec) => codec.decompress(image, data, options),
            None => image,
        }
    }

    pub fn can_encode(&self, format: ImageFormat) -> bool {
        self.ordered().iter().any(|codec| codec.can_encode(format))
    }

    /// Encode `image`. An undefined format picks PNG for images with alpha, JPEG otherwise.
    pub fn encode(&self, image: &Image, format: ImageFormat) -> Result<Bytes, CodecError> {
        let format = match format {
            ImageFormat::Undefined if image.has_alpha() => ImageFormat::Png,
            ImageFormat::Undefined => ImageFormat::Jpeg,
            other => other,
        };
        let codec = self
            .ordered()
            .into_iter()
            .find(|codec| codec.can_encode(format))
            .ok_or(CodecError::Unsupported)?;
        codec.encode(image, format)
    }
}

impl Default for CodecChain {
    fn default() -> Self {
        Self::with_defaults()
    }
}
