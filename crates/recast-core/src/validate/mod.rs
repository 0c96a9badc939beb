//! Upload validation: size, extension, sniffed content type and magic-byte
//! signature, checked in that order. The first failing check ends
//! validation.

pub mod signature;
pub mod sniff;

use std::io::{Read, Seek};

use thiserror::Error;
use tracing::debug;

use crate::asset::UploadedAsset;
use crate::format::ImageFormat;

use self::sniff::{ALLOWED_SNIFFED, SNIFF_LEN};

/// Default upload ceiling (20 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 << 20;

/// Reasons an upload is refused before decoding.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file size of {size} bytes exceeds the limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("uploaded file is empty")]
    Empty,

    #[error("unsupported file format: {0:?}")]
    UnsupportedExtension(String),

    #[error("invalid MIME type: {0}")]
    DisallowedContentType(&'static str),

    #[error("failed to detect the type of the file")]
    UnrecognizedSignature,

    #[error("file content does not match the extension: expected {expected} instead of {actual}")]
    SignatureMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to read file header: {0}")]
    Read(#[from] std::io::Error),
}

/// Checks that an upload is what it claims to be.
#[derive(Debug, Clone)]
pub struct SignatureValidator {
    max_upload_bytes: u64,
}

impl Default for SignatureValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_BYTES)
    }
}

impl SignatureValidator {
    pub fn new(max_upload_bytes: u64) -> Self {
        Self { max_upload_bytes }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Run every check against `asset` and return the verified format.
    pub fn validate<R: Read + Seek>(
        &self,
        asset: &mut UploadedAsset<R>,
    ) -> Result<ImageFormat, ValidationError> {
        self.check_size(asset.size())?;
        let declared = check_extension(asset.extension())?;

        let sniffed = {
            let mut view = asset.view()?;
            let prefix = view.prefix(SNIFF_LEN)?;
            if prefix.is_empty() {
                return Err(ValidationError::Empty);
            }
            sniff::sniff(&prefix)
        };
        if !ALLOWED_SNIFFED.contains(&sniffed) {
            return Err(ValidationError::DisallowedContentType(sniffed));
        }

        let detected = {
            let mut view = asset.view()?;
            signature::detect(&view.prefix(SNIFF_LEN)?)
        };
        let detected = detected.ok_or(ValidationError::UnrecognizedSignature)?;
        if detected.mime_type() != declared.mime_type() {
            return Err(ValidationError::SignatureMismatch {
                expected: declared.mime_type(),
                actual: detected.mime_type(),
            });
        }

        debug!(
            filename = %asset.filename(),
            format = %detected,
            sniffed,
            "upload validated"
        );
        Ok(detected)
    }

    fn check_size(&self, size: u64) -> Result<(), ValidationError> {
        if size > self.max_upload_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_upload_bytes,
            });
        }
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        Ok(())
    }
}

fn check_extension(ext: &str) -> Result<ImageFormat, ValidationError> {
    ImageFormat::from_extension(ext)
        .ok_or_else(|| ValidationError::UnsupportedExtension(ext.to_owned()))
}
