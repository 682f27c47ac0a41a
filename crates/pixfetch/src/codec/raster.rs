use std::io::Cursor;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, DynamicImage, RgbaImage};
use tracing::debug;

use super::{CodecError, DecompressOptions, ImageCodec, ProgressiveDecoder};
use crate::bitmap::{Image, ImageFormat};

/// Largest decoded image kept at full size when scale-down is requested:
/// 60 MB of RGBA8 pixels.
pub const MAX_DECODED_PIXELS: u64 = 60 * 1024 * 1024 / 4;

/// Codec for the common raster formats, backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct RasterCodec {
    max_pixels: u64,
}

impl RasterCodec {
    pub fn new() -> Self {
        Self {
            max_pixels: MAX_DECODED_PIXELS,
        }
    }

    /// Override the pixel budget used when scaling down.
    pub fn with_max_pixels(max_pixels: u64) -> Self {
        Self {
            max_pixels: max_pixels.max(1),
        }
    }

    fn scale_down(&self, image: &Image) -> Option<Image> {
        let ratio = (self.max_pixels as f64 / image.pixel_count() as f64).sqrt();
        let width = ((f64::from(image.width()) * ratio).floor() as u32).max(1);
        let height = ((f64::from(image.height()) * ratio).floor() as u32).max(1);

        let buffer = RgbaImage::from_raw(image.width(), image.height(), image.pixels().to_vec())?;
        let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);
        debug!(
            from_width = image.width(),
            from_height = image.height(),
            width,
            height,
            "Scaled down oversized image"
        );

        Some(
            Image::from_rgba(width, height, resized.into_raw())
                .with_format(image.format())
                .with_alpha(false),
        )
    }
}

impl Default for RasterCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCodec for RasterCodec {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        image::guess_format(data)
            .map(|format| format.reading_enabled())
            .unwrap_or(false)
    }

    fn decode(&self, data: &[u8]) -> Result<Image, CodecError> {
        let format = image::guess_format(data).map_err(|_| CodecError::Unsupported)?;
        decode_with_format(data, format)
    }

    fn progressive_decoder(&self, data: &[u8]) -> Option<Box<dyn ProgressiveDecoder>> {
        let format = image::guess_format(data).ok()?;
        if !format.reading_enabled() {
            return None;
        }
        Some(Box::new(RasterProgressiveDecoder {
            format: Some(format),
        }))
    }

    /// Animated images and images with alpha are left untouched.
    fn decompress(&self, image: Image, _data: &[u8], options: DecompressOptions) -> Image {
        if image.is_animated() || image.has_alpha() {
            return image;
        }
        if !options.scale_down || image.pixel_count() <= self.max_pixels {
            return image;
        }
        match self.scale_down(&image) {
            Some(scaled) => scaled,
            None => image,
        }
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        to_image_format(format)
            .map(|format| format.writing_enabled())
            .unwrap_or(false)
    }

    fn encode(&self, image: &Image, format: ImageFormat) -> Result<Bytes, CodecError> {
        let target = to_image_format(format)
            .filter(|format| format.writing_enabled())
            .ok_or(CodecError::Unsupported)?;

        let buffer = RgbaImage::from_raw(image.width(), image.height(), image.pixels().to_vec())
            .ok_or_else(|| {
                CodecError::Encode("pixel buffer does not match image dimensions".to_string())
            })?;

        // JPEG has no alpha channel
        let dynamic = match target {
            image::ImageFormat::Jpeg => {
                DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(buffer).to_rgb8())
            }
            _ => DynamicImage::ImageRgba8(buffer),
        };

        let mut out = Cursor::new(Vec::new());
        dynamic
            .write_to(&mut out, target)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(out.into_inner()))
    }
}

/// Re-decodes the whole prefix on every call and yields an image once it parses.
struct RasterProgressiveDecoder {
    format: Option<image::ImageFormat>,
}

impl ProgressiveDecoder for RasterProgressiveDecoder {
    fn can_incrementally_decode(&self, data: &[u8]) -> bool {
        image::guess_format(data).is_ok()
    }

    fn incremental_decode(&mut self, data: &[u8], _finished: bool) -> Option<Image> {
        let format = match self.format {
            Some(format) => format,
            None => {
                let format = image::guess_format(data).ok()?;
                self.format = Some(format);
                format
            }
        };
        decode_with_format(data, format).ok()
    }
}

fn decode_with_format(data: &[u8], format: image::ImageFormat) -> Result<Image, CodecError> {
    let decoded = image::load_from_memory_with_format(data, format)
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    let frame_count = match format {
        image::ImageFormat::Gif => count_gif_frames(data),
        _ => 1,
    };

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(Image::from_rgba(width, height, rgba.into_raw())
        .with_frame_count(frame_count)
        .with_format(from_image_format(format)))
}

fn count_gif_frames(data: &[u8]) -> u32 {
    image::codecs::gif::GifDecoder::new(Cursor::new(data))
        .map(|decoder| decoder.into_frames().count() as u32)
        .unwrap_or(1)
}

fn to_image_format(format: ImageFormat) -> Option<image::ImageFormat> {
    match format {
        ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        ImageFormat::Png => Some(image::ImageFormat::Png),
        ImageFormat::Gif => Some(image::ImageFormat::Gif),
        ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
        ImageFormat::Webp => Some(image::ImageFormat::WebP),
        ImageFormat::Heic | ImageFormat::Undefined => None,
    }
}

fn from_image_format(format: image::ImageFormat) -> ImageFormat {
    match format {
        image::ImageFormat::Jpeg => ImageFormat::Jpeg,
        image::ImageFormat::Png => ImageFormat::Png,
        image::ImageFormat::Gif => ImageFormat::Gif,
        image::ImageFormat::Tiff => ImageFormat::Tiff,
        image::ImageFormat::WebP => ImageFormat::Webp,
        _ => ImageFormat::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::png_bytes;
    use image::codecs::gif::GifEncoder;
    use image::{Frame, Rgba};

    #[test]
    fn test_decode_png() {
        let codec = RasterCodec::new();
        let data = png_bytes(12, 7, [10, 20, 30, 255]);

        assert!(codec.can_decode(&data));
        let image = codec.decode(&data).unwrap();
        assert_eq!((image.width(), image.height()), (12, 7));
        assert_eq!(image.format(), ImageFormat::Png);
        assert!(!image.is_animated());
        assert_eq!(image.cost(), 12 * 7 * 4);
    }

    #[test]
    fn test_scale_down_respects_budget() {
        let codec = RasterCodec::with_max_pixels(100);
        let image = codec.decode(&png_bytes(20, 20, [1, 2, 3, 255])).unwrap();
        assert!(!image.has_alpha());

        let untouched = codec.decompress(image.clone(), &[], DecompressOptions::default());
        assert!(untouched.ptr_eq(&image));

        let scaled = codec.decompress(image, &[], DecompressOptions { scale_down: true });
        assert_eq!((scaled.width(), scaled.height()), (10, 10));
    }

    #[test]
    fn test_alpha_images_are_exempt() {
        let codec = RasterCodec::with_max_pixels(10);
        let image = codec.decode(&png_bytes(20, 20, [1, 2, 3, 128])).unwrap();
        assert!(image.has_alpha());

        let result = codec.decompress(image.clone(), &[], DecompressOptions { scale_down: true });
        assert!(result.ptr_eq(&image));
    }

    #[test]
    fn test_animated_gif_frames() {
        let mut data = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut data);
            let frames = (0..2u8).map(|i| {
                Frame::new(RgbaImage::from_pixel(4, 4, Rgba([i * 100, 0, 0, 255])))
            });
            encoder.encode_frames(frames).unwrap();
        }

        let codec = RasterCodec::with_max_pixels(1);
        let image = codec.decode(&data).unwrap();
        assert_eq!(image.format(), ImageFormat::Gif);
        assert_eq!(image.frame_count(), 2);
        assert!(image.is_animated());

        let result = codec.decompress(image.clone(), &data, DecompressOptions { scale_down: true });
        assert!(result.ptr_eq(&image));
    }

    #[test]
    fn test_encode_jpeg_drops_alpha() {
        let codec = RasterCodec::new();
        let image = Image::from_rgba(3, 2, vec![200u8; 3 * 2 * 4]);

        assert!(codec.can_encode(ImageFormat::Jpeg));
        assert!(!codec.can_encode(ImageFormat::Heic));

        let encoded = codec.encode(&image, ImageFormat::Jpeg).unwrap();
        assert_eq!(ImageFormat::detect(&encoded), ImageFormat::Jpeg);
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[test]
    fn test_progressive_decoder_waits_for_complete_data() {
        let codec = RasterCodec::new();
        let data = png_bytes(16, 16, [9, 9, 9, 255]);
        let partial = &data[..data.len() / 2];

        let mut decoder = codec.progressive_decoder(partial).unwrap();
        assert!(decoder.can_incrementally_decode(partial));
        assert!(decoder.incremental_decode(partial, false).is_none());

        let image = decoder.incremental_decode(&data, true).unwrap();
        assert_eq!(image.width(), 16);
    }
}
