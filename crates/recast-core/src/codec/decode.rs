use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat as RasterFormat, ImageReader, Limits};
use tracing::debug;

use super::{psd, svg, CanonicalImage, CodecError, MAX_RASTER_SIDE};
use crate::format::ImageFormat;

/// Decode strategy: raw file bytes in, canonical raster out.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<CanonicalImage, CodecError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DecoderRegistry {
    strategies: HashMap<ImageFormat, DecodeFn>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

impl DecoderRegistry {
    /// An empty registry; every decode fails until strategies are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a decoder for every accepted input format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (format, raster) in [
            (ImageFormat::Png, RasterFormat::Png),
            (ImageFormat::Jpeg, RasterFormat::Jpeg),
            (ImageFormat::Gif, RasterFormat::Gif),
            (ImageFormat::Bmp, RasterFormat::Bmp),
            (ImageFormat::Tiff, RasterFormat::Tiff),
            (ImageFormat::WebP, RasterFormat::WebP),
        ] {
            registry.register(format, move |bytes| decode_raster(format, raster, bytes));
        }
        registry.register(ImageFormat::Svg, svg::rasterize);
        registry.register(ImageFormat::Psd, psd::decode);
        registry
    }

    /// Install or replace the strategy for `format`.
    pub fn register<F>(&mut self, format: ImageFormat, strategy: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<CanonicalImage, CodecError> + Send + Sync + 'static,
    {
        self.strategies.insert(format, Arc::new(strategy));
        self
    }

    pub fn supports(&self, format: ImageFormat) -> bool {
        self.strategies.contains_key(&format)
    }

    /// Registered formats in declaration order.
    pub fn formats(&self) -> Vec<ImageFormat> {
        let mut formats: Vec<_> = self.strategies.keys().copied().collect();
        formats.sort_by_key(|f| *f as u8);
        formats
    }

    pub fn decode(&self, format: ImageFormat, bytes: &[u8]) -> Result<CanonicalImage, CodecError> {
        let strategy = self
            .strategies
            .get(&format)
            .ok_or(CodecError::UnsupportedFormat(format))?;
        let image = strategy(bytes)?;
        debug!(
            %format,
            width = image.width(),
            height = image.height(),
            pixel_format = ?image.pixel_format(),
            "decoded image"
        );
        Ok(image)
    }
}

// Animated GIFs yield their first frame here.
fn decode_raster(
    format: ImageFormat,
    raster: RasterFormat,
    bytes: &[u8],
) -> Result<CanonicalImage, CodecError> {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_RASTER_SIDE);
    limits.max_image_height = Some(MAX_RASTER_SIDE);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), raster);
    reader.limits(limits);
    reader
        .decode()
        .map(CanonicalImage::new)
        .map_err(|e| CodecError::decode(format, e))
}
