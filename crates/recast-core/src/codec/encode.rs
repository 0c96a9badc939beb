use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::bmp::BmpEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use tracing::debug;

use super::{CanonicalImage, CodecError};
use crate::format::{ImageFormat, OUTPUT_FORMATS};

pub const JPEG_QUALITY: u8 = 90;
pub const GIF_SPEED: i32 = 10;

/// Encode strategy: consumes the raster and returns a complete file.
pub type EncodeFn = Arc<dyn Fn(CanonicalImage) -> Result<Vec<u8>, CodecError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EncoderRegistry {
    strategies: HashMap<ImageFormat, EncodeFn>,
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

impl EncoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the fixed-parameter encoder for every output format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(ImageFormat::Jpeg, encode_jpeg)
            .register(ImageFormat::Png, encode_png)
            .register(ImageFormat::WebP, encode_webp)
            .register(ImageFormat::Gif, encode_gif)
            .register(ImageFormat::Bmp, encode_bmp);
        debug_assert!(OUTPUT_FORMATS.iter().all(|f| registry.supports(*f)));
        registry
    }

    pub fn register<F>(&mut self, format: ImageFormat, strategy: F) -> &mut Self
    where
        F: Fn(CanonicalImage) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        self.strategies.insert(format, Arc::new(strategy));
        self
    }

    pub fn supports(&self, format: ImageFormat) -> bool {
        self.strategies.contains_key(&format)
    }

    pub fn formats(&self) -> Vec<ImageFormat> {
        let mut formats: Vec<_> = self.strategies.keys().copied().collect();
        formats.sort_by_key(|f| *f as u8);
        formats
    }

    pub fn encode(&self, format: ImageFormat, image: CanonicalImage) -> Result<Bytes, CodecError> {
        let strategy = self
            .strategies
            .get(&format)
            .ok_or(CodecError::UnsupportedFormat(format))?;
        let (width, height) = (image.width(), image.height());
        let out = strategy(image)?;
        debug!(%format, width, height, bytes = out.len(), "encoded image");
        Ok(Bytes::from(out))
    }
}

// ── Strategies ──────────────────────────────────────────────────────────────

fn encode_jpeg(image: CanonicalImage) -> Result<Vec<u8>, CodecError> {
    let rgb = flatten_onto_white(image.into_dynamic());
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| CodecError::encode(ImageFormat::Jpeg, e))?;
    Ok(out)
}

fn encode_png(image: CanonicalImage) -> Result<Vec<u8>, CodecError> {
    let (width, height) = (image.width(), image.height());
    let (pixels, color) = rgb_or_rgba(image.into_dynamic());
    let mut out = Vec::new();
    PngEncoder::new_with_quality(&mut out, CompressionType::Default, FilterType::Adaptive)
        .write_image(&pixels, width, height, color)
        .map_err(|e| CodecError::encode(ImageFormat::Png, e))?;
    Ok(out)
}

fn encode_webp(image: CanonicalImage) -> Result<Vec<u8>, CodecError> {
    let (width, height) = (image.width(), image.height());
    let (pixels, color) = rgb_or_rgba(image.into_dynamic());
    let mut out = Vec::new();
    WebPEncoder::new_lossless(&mut out)
        .write_image(&pixels, width, height, color)
        .map_err(|e| CodecError::encode(ImageFormat::WebP, e))?;
    Ok(out)
}

fn encode_gif(image: CanonicalImage) -> Result<Vec<u8>, CodecError> {
    let rgba = image.into_dynamic().into_rgba8();
    let mut out = Vec::new();
    {
        // The trailer is written when the encoder drops.
        let mut encoder = GifEncoder::new_with_speed(&mut out, GIF_SPEED);
        encoder
            .encode(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
            .map_err(|e| CodecError::encode(ImageFormat::Gif, e))?;
    }
    Ok(out)
}

fn encode_bmp(image: CanonicalImage) -> Result<Vec<u8>, CodecError> {
    let rgba = image.into_dynamic().into_rgba8();
    let mut out = Vec::new();
    BmpEncoder::new(&mut out)
        .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
        .map_err(|e| CodecError::encode(ImageFormat::Bmp, e))?;
    Ok(out)
}

// ── Pixel helpers ───────────────────────────────────────────────────────────

/// 8-bit RGB or RGBA, depending on whether the source carries alpha.
fn rgb_or_rgba(image: DynamicImage) -> (Vec<u8>, ExtendedColorType) {
    if image.color().has_alpha() {
        (image.into_rgba8().into_raw(), ExtendedColorType::Rgba8)
    } else {
        (image.into_rgb8().into_raw(), ExtendedColorType::Rgb8)
    }
}

/// JPEG has no alpha channel; composite over an opaque white background.
fn flatten_onto_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.into_rgb8();
    }
    let rgba = image.into_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let (c, a) = (u32::from(c), u32::from(a));
            ((c * a + 255 * (255 - a) + 127) / 255) as u8
        };
        Rgb([blend(r), blend(g), blend(b)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn canvas(width: u32, height: u32, pixel: [u8; 4]) -> CanonicalImage {
        CanonicalImage::new(DynamicImage::ImageRgba8(ImageBuffer::from_pixel(
            width,
            height,
            Rgba(pixel),
        )))
    }

    #[test]
    fn every_output_format_round_trips_dimensions() {
        let registry = EncoderRegistry::with_defaults();
        for &format in OUTPUT_FORMATS {
            let bytes = registry
                .encode(format, canvas(5, 4, [200, 10, 10, 255]))
                .unwrap_or_else(|e| panic!("{format}: {e}"));
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (5, 4), "{format}");
        }
    }

    #[test]
    fn jpeg_flattens_transparency_onto_white() {
        let bytes = EncoderRegistry::with_defaults()
            .encode(ImageFormat::Jpeg, canvas(8, 8, [0, 0, 0, 0]))
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().into_rgb8();
        let Rgb([r, g, b]) = *decoded.get_pixel(4, 4);
        assert!(r > 245 && g > 245 && b > 245, "got {r},{g},{b}");
    }

    #[test]
    fn svg_is_not_an_output_format() {
        let registry = EncoderRegistry::with_defaults();
        assert!(matches!(
            registry.encode(ImageFormat::Svg, canvas(1, 1, [0, 0, 0, 255])),
            Err(CodecError::UnsupportedFormat(ImageFormat::Svg))
        ));
        assert_eq!(registry.formats().len(), OUTPUT_FORMATS.len());
    }

    #[test]
    fn flatten_keeps_opaque_pixels() {
        let rgb = flatten_onto_white(canvas(1, 1, [12, 34, 56, 255]).into_dynamic());
        assert_eq!(rgb.get_pixel(0, 0).0, [12, 34, 56]);
    }
}
