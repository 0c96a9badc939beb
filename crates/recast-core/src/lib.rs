//! recast-core – the validation-and-conversion pipeline behind recast-server.
//!
//! An upload travels through:
//! 1. [`SignatureValidator`] – size, extension, sniffed content type and
//!    magic-byte signature must agree.
//! 2. [`SvgSanitizer`] – vector input only; rejects scripts and handlers.
//! 3. [`DecoderRegistry`] – source format → [`CanonicalImage`].
//! 4. [`EncoderRegistry`] – [`CanonicalImage`] → target format bytes.
//!
//! [`ConversionPipeline`] drives those stages and reports progress to the
//! shared [`ProgressStore`].

pub mod asset;
pub mod codec;
pub mod format;
pub mod pipeline;
pub mod progress;
pub mod sanitize;
pub mod storage;
pub mod validate;

pub use asset::{sanitize_filename, Rewind, UploadedAsset};
pub use codec::{CanonicalImage, CodecError, DecoderRegistry, EncoderRegistry};
pub use format::ImageFormat;
pub use pipeline::{
    Conversion, ConversionJob, ConversionPipeline, JobHandle, JobState, Milestone, PipelineConfig,
    PipelineError, ProgressStream,
};
pub use progress::ProgressStore;
pub use sanitize::{SanitizeError, SvgSanitizer};
pub use storage::{FsScratch, MemoryScratch, ScratchArea, ScratchKey, ScratchStore, StorageError};
pub use validate::{SignatureValidator, ValidationError};
