//! Decoder and encoder registries.
//!
//! Both registries map an [`ImageFormat`] to a strategy closure and are built
//! once at startup. A tag with no registered strategy is an error; there is
//! no fallback codec.

mod decode;
mod encode;
pub mod psd;
pub mod svg;

pub use decode::{DecodeFn, DecoderRegistry};
pub use encode::{EncodeFn, EncoderRegistry};

use image::{ColorType, DynamicImage};
use thiserror::Error;

use crate::format::ImageFormat;

/// Longest side the image-crate decoders accept.
pub const MAX_RASTER_SIDE: u32 = 8192;

/// Largest raster any decoder will allocate. SVG and PSD check their stated
/// size against it; the image-crate formats are held to [`MAX_RASTER_SIDE`]
/// on each axis, which keeps them under it too.
pub const MAX_RASTER_PIXELS: u64 = MAX_RASTER_SIDE as u64 * MAX_RASTER_SIDE as u64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(ImageFormat),

    #[error("failed to decode {format} image: {message}")]
    Decode {
        format: ImageFormat,
        message: String,
    },

    #[error("failed to encode {format} image: {message}")]
    Encode {
        format: ImageFormat,
        message: String,
    },
}

impl CodecError {
    pub fn decode(format: ImageFormat, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            format,
            message: message.to_string(),
        }
    }

    pub fn encode(format: ImageFormat, message: impl std::fmt::Display) -> Self {
        Self::Encode {
            format,
            message: message.to_string(),
        }
    }
}

/// Format-neutral raster handed from a decoder to exactly one encoder.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    inner: DynamicImage,
}

impl CanonicalImage {
    pub fn new(inner: DynamicImage) -> Self {
        Self { inner }
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn pixel_format(&self) -> ColorType {
        self.inner.color()
    }

    pub fn has_alpha(&self) -> bool {
        self.inner.color().has_alpha()
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.inner
    }

    pub fn into_dynamic(self) -> DynamicImage {
        self.inner
    }
}

impl From<DynamicImage> for CanonicalImage {
    fn from(inner: DynamicImage) -> Self {
        Self::new(inner)
    }
}
