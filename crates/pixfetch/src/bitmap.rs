//! Decoded raster images and container format detection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Container format of encoded image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    Undefined,
    Jpeg,
    Png,
    Gif,
    Tiff,
    Webp,
    Heic,
}

impl ImageFormat {
    /// Sniff the format from the leading bytes.
    pub fn detect(data: &[u8]) -> Self {
        match data.first() {
            Some(0xFF) => ImageFormat::Jpeg,
            Some(0x89) => ImageFormat::Png,
            Some(0x47) => ImageFormat::Gif,
            Some(0x49) | Some(0x4D) => ImageFormat::Tiff,
            Some(0x52) if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" => {
                ImageFormat::Webp
            }
            Some(0x00) if data.len() >= 12 => match &data[4..12] {
                b"ftypheic" | b"ftypheix" | b"ftyphevc" | b"ftyphevx" => ImageFormat::Heic,
                _ => ImageFormat::Undefined,
            },
            _ => ImageFormat::Undefined,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Heic => "image/heic",
            ImageFormat::Undefined => "application/octet-stream",
        }
    }

    pub fn from_mime_type(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
            "image/png" => ImageFormat::Png,
            "image/gif" => ImageFormat::Gif,
            "image/tiff" => ImageFormat::Tiff,
            "image/webp" => ImageFormat::Webp,
            "image/heic" | "image/heif" => ImageFormat::Heic,
            _ => ImageFormat::Undefined,
        }
    }
}

#[derive(Clone)]
struct ImageInner {
    width: u32,
    height: u32,
    format: ImageFormat,
    frame_count: u32,
    has_alpha: bool,
    pixels: Bytes,
}

/// An immutable decoded image.
///
/// Clones share the same pixel buffer. Animated images keep only their first
/// frame as pixels and report the total number of frames.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

impl Image {
    /// Create an image from tightly packed RGBA8 pixels.
    pub fn from_rgba(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        let pixels = pixels.into();
        let has_alpha = pixels.chunks_exact(4).any(|px| px[3] != u8::MAX);
        Self {
            inner: Arc::new(ImageInner {
                width,
                height,
                format: ImageFormat::Undefined,
                frame_count: 1,
                has_alpha,
                pixels,
            }),
        }
    }

    pub fn with_format(self, format: ImageFormat) -> Self {
        self.map_inner(|inner| inner.format = format)
    }

    pub fn with_frame_count(self, frame_count: u32) -> Self {
        self.map_inner(|inner| inner.frame_count = frame_count.max(1))
    }

    /// Override the alpha flag, e.g. when the source color type declares an alpha channel.
    pub fn with_alpha(self, has_alpha: bool) -> Self {
        self.map_inner(|inner| inner.has_alpha = has_alpha)
    }

    fn map_inner(self, f: impl FnOnce(&mut ImageInner)) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> ImageFormat {
        self.inner.format
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.frame_count
    }

    pub fn is_animated(&self) -> bool {
        self.inner.frame_count > 1
    }

    pub fn has_alpha(&self) -> bool {
        self.inner.has_alpha
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.inner.width) * u64::from(self.inner.height)
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count() == 0
    }

    /// RGBA8 pixels of the first frame.
    pub fn pixels(&self) -> &Bytes {
        &self.inner.pixels
    }

    /// Memory cost of keeping the decoded image resident.
    pub fn cost(&self) -> u64 {
        self.inner.pixels.len() as u64
    }

    /// Whether both handles refer to the same decoded instance.
    pub fn ptr_eq(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("frame_count", &self.inner.frame_count)
            .field("has_alpha", &self.inner.has_alpha)
            .finish()
    }
}
