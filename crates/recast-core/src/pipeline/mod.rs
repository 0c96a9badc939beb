//! Conversion pipeline: validate → sanitize (SVG only) → persist → decode →
//! encode → write, reporting fixed milestones to the [`ProgressStore`].
//!
//! A job is opened with [`ConversionPipeline::begin`], driven by
//! [`ConversionPipeline::run`] and settled by draining the
//! [`ProgressStream`] returned from [`JobHandle::stream`]. A handle that is
//! dropped before it settles fails the job.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::asset::UploadedAsset;
use crate::codec::{CodecError, DecoderRegistry, EncoderRegistry};
use crate::format::ImageFormat;
use crate::progress::ProgressStore;
use crate::sanitize::{SanitizeError, SvgSanitizer};
use crate::storage::{ScratchArea, ScratchKey, ScratchStore, StorageError};
use crate::validate::{SignatureValidator, ValidationError, DEFAULT_MAX_UPLOAD_BYTES};

#[cfg(test)]
mod tests;

/// How long a finished job stays pollable at 100%.
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(30);

const MAX_JOB_ID_LEN: usize = 64;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("conversion task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Whether the request itself was at fault, as opposed to the server.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::BadRequest(_) | Self::Codec(_) => true,
            Self::Validation(e) => !matches!(e, ValidationError::Read(_)),
            Self::Sanitize(e) => !matches!(e, SanitizeError::Read(_)),
            Self::Storage(_) | Self::Task(_) => false,
        }
    }
}

// ── Job model ───────────────────────────────────────────────────────────────

/// Progress percentages reported at each stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Milestone {
    Created = 0,
    FormParsed = 10,
    Validated = 20,
    Persisted = 40,
    Decoded = 60,
    Encoded = 80,
    Written = 90,
    Streamed = 100,
}

impl Milestone {
    pub fn percent(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Created,
    Validating,
    Sanitizing,
    Decoding,
    Encoding,
    Streaming,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// One pipeline run, known once the upload has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub id: String,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub created_at: DateTime<Utc>,
}

/// A finished conversion, ready to be streamed.
#[derive(Debug)]
pub struct Conversion<R> {
    pub job: ConversionJob,
    /// `<original stem>.<target extension>`.
    pub download_name: String,
    pub content_type: &'static str,
    pub content_length: u64,
    pub reader: R,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_upload_bytes: u64,
    pub progress_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            progress_ttl: DEFAULT_PROGRESS_TTL,
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

pub struct ConversionPipeline<S> {
    config: PipelineConfig,
    validator: SignatureValidator,
    sanitizer: SvgSanitizer,
    decoders: Arc<DecoderRegistry>,
    encoders: Arc<EncoderRegistry>,
    progress: ProgressStore,
    scratch: Arc<S>,
}

impl<S> std::fmt::Debug for ConversionPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPipeline")
            .field("config", &self.config)
            .field("decoders", &self.decoders)
            .field("encoders", &self.encoders)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl<S: ScratchStore> ConversionPipeline<S> {
    /// Pipeline with the default codec registries.
    pub fn new(config: PipelineConfig, scratch: S) -> Self {
        Self {
            validator: SignatureValidator::new(config.max_upload_bytes),
            sanitizer: SvgSanitizer::new(),
            decoders: Arc::new(DecoderRegistry::with_defaults()),
            encoders: Arc::new(EncoderRegistry::with_defaults()),
            progress: ProgressStore::new(),
            scratch: Arc::new(scratch),
            config,
        }
    }

    pub fn with_decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = Arc::new(decoders);
        self
    }

    pub fn with_encoders(mut self, encoders: EncoderRegistry) -> Self {
        self.encoders = Arc::new(encoders);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    pub fn encoders(&self) -> &EncoderRegistry {
        &self.encoders
    }

    pub fn scratch(&self) -> &S {
        &self.scratch
    }

    /// Open a job at 0%. `requested_id` lets a client pick the id it will
    /// poll; otherwise a random one is generated.
    pub fn begin(&self, requested_id: Option<&str>) -> Result<JobHandle<S>, PipelineError> {
        let id = match requested_id {
            Some(id) if is_valid_job_id(id) => id.to_owned(),
            Some(_) => {
                return Err(PipelineError::BadRequest(format!(
                    "invalid job id: use 1 to {MAX_JOB_ID_LEN} letters, digits, '-' or '_'"
                )));
            }
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        if !self.progress.start(&id) {
            return Err(PipelineError::BadRequest(format!(
                "job id {id:?} is already in use"
            )));
        }
        debug!(job_id = %id, "job created");

        Ok(JobHandle {
            id,
            created_at: Utc::now(),
            state: JobState::Created,
            progress: self.progress.clone(),
            scratch: Arc::clone(&self.scratch),
            ttl: self.config.progress_ttl,
            scratch_files: Vec::new(),
        })
    }

    /// Convert `asset` to `target`. On failure the job is settled as failed
    /// before the error is returned.
    pub async fn run(
        &self,
        job: &mut JobHandle<S>,
        asset: UploadedAsset,
        target: ImageFormat,
    ) -> Result<Conversion<S::Reader>, PipelineError> {
        let span = info_span!("conversion", job_id = %job.id, %target);
        let result = self.run_stages(job, asset, target).instrument(span).await;
        match result {
            Ok(conversion) => Ok(conversion),
            Err(e) => {
                job.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        job: &mut JobHandle<S>,
        mut asset: UploadedAsset,
        target: ImageFormat,
    ) -> Result<Conversion<S::Reader>, PipelineError> {
        job.enter(JobState::Validating);
        if !self.encoders.supports(target) {
            return Err(CodecError::UnsupportedFormat(target).into());
        }
        let source = self.validator.validate(&mut asset)?;
        if !self.decoders.supports(source) {
            return Err(CodecError::UnsupportedFormat(source).into());
        }
        job.reach(Milestone::Validated);

        if source.is_vector() {
            job.enter(JobState::Sanitizing);
            self.sanitizer.scan(&mut asset)?;
        }

        let upload = self
            .scratch
            .create(ScratchArea::Uploads, asset.filename(), asset.bytes().clone())
            .await?;
        job.scratch_files.push(upload);
        job.reach(Milestone::Persisted);

        let download_name = format!("{}.{}", asset.stem(), target.extension());
        info!(
            %source,
            filename = %asset.filename(),
            bytes = asset.size(),
            "converting upload"
        );

        job.enter(JobState::Decoding);
        let bytes = asset.into_bytes();
        let decoders = Arc::clone(&self.decoders);
        let image = tokio::task::spawn_blocking(move || decoders.decode(source, &bytes))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        job.reach(Milestone::Decoded);

        job.enter(JobState::Encoding);
        let encoders = Arc::clone(&self.encoders);
        let output = tokio::task::spawn_blocking(move || encoders.encode(target, image))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        job.reach(Milestone::Encoded);

        job.enter(JobState::Streaming);
        let converted = self
            .scratch
            .create(ScratchArea::Converted, &download_name, output)
            .await?;
        job.scratch_files.push(converted.clone());
        let (reader, content_length) = self.scratch.open(&converted).await?;
        job.reach(Milestone::Written);

        Ok(Conversion {
            job: ConversionJob {
                id: job.id.clone(),
                source_format: source,
                target_format: target,
                created_at: job.created_at,
            },
            download_name,
            content_type: target.mime_type(),
            content_length,
            reader,
        })
    }
}

fn is_valid_job_id(id: &str) -> bool {
    (1..=MAX_JOB_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

// ── Job handle ──────────────────────────────────────────────────────────────

/// Owner of one job's progress entry until the job settles.
pub struct JobHandle<S: ScratchStore> {
    id: String,
    created_at: DateTime<Utc>,
    state: JobState,
    progress: ProgressStore,
    scratch: Arc<S>,
    ttl: Duration,
    /// Files written for this job, removed if it fails.
    scratch_files: Vec<ScratchKey>,
}

impl<S: ScratchStore> std::fmt::Debug for JobHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("scratch_files", &self.scratch_files)
            .finish_non_exhaustive()
    }
}

impl<S: ScratchStore> JobHandle<S> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The multipart form has been read.
    pub fn form_parsed(&mut self) {
        self.reach(Milestone::FormParsed);
    }

    /// Settle the job as failed because of something outside the pipeline
    /// (a malformed form, an oversized field).
    pub async fn reject(mut self, reason: &PipelineError) {
        self.fail(reason).await;
    }

    /// Wrap the converted output in a body stream that completes the job at
    /// end of input.
    pub fn stream<R: AsyncRead>(self, reader: R) -> ProgressStream<R, S> {
        ProgressStream {
            inner: ReaderStream::new(reader),
            job: Some(self),
        }
    }

    fn enter(&mut self, state: JobState) {
        debug!(job_id = %self.id, from = %self.state, to = %state, "job state");
        self.state = state;
    }

    fn reach(&self, milestone: Milestone) {
        self.progress.advance(&self.id, milestone.percent());
    }

    fn complete(&mut self) {
        self.reach(Milestone::Streamed);
        self.state = JobState::Done;
        self.progress.expire(&self.id, self.ttl);
        info!(job_id = %self.id, "conversion complete");
    }

    async fn fail(&mut self, reason: &(dyn std::fmt::Display + Sync)) {
        if self.mark_failed(reason) {
            for key in std::mem::take(&mut self.scratch_files) {
                if let Err(e) = self.scratch.delete(&key).await {
                    warn!(job_id = %self.id, key = %key, error = %e, "failed to remove scratch file");
                }
            }
        }
    }

    /// Failure from a synchronous context; scratch cleanup runs in the
    /// background when a runtime is available.
    fn fail_detached(&mut self, reason: &dyn std::fmt::Display) {
        if !self.mark_failed(reason) || self.scratch_files.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(job_id = %self.id, "no runtime to remove scratch files");
            return;
        };
        let scratch = Arc::clone(&self.scratch);
        let keys = std::mem::take(&mut self.scratch_files);
        let job_id = self.id.clone();
        runtime.spawn(async move {
            for key in keys {
                if let Err(e) = scratch.delete(&key).await {
                    warn!(%job_id, key = %key, error = %e, "failed to remove scratch file");
                }
            }
        });
    }

    /// Returns `false` if the job had already settled.
    fn mark_failed(&mut self, reason: &dyn std::fmt::Display) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        warn!(job_id = %self.id, state = %self.state, error = %reason, "conversion failed");
        self.state = JobState::Failed;
        self.progress.discard(&self.id);
        true
    }
}

impl<S: ScratchStore> Drop for JobHandle<S> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.fail_detached(&"job abandoned before completion");
        }
    }
}

// ── Body stream ─────────────────────────────────────────────────────────────

/// Byte stream over a converted file that settles its job: done at end of
/// input, failed on a read error or when dropped early.
pub struct ProgressStream<R, S: ScratchStore> {
    inner: ReaderStream<R>,
    job: Option<JobHandle<S>>,
}

impl<R, S: ScratchStore> std::fmt::Debug for ProgressStream<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream")
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl<R, S> Stream for ProgressStream<R, S>
where
    R: AsyncRead + Unpin,
    S: ScratchStore,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);
        match &polled {
            Poll::Ready(None) => {
                if let Some(mut job) = this.job.take() {
                    job.complete();
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(mut job) = this.job.take() {
                    job.fail_detached(e);
                }
            }
            _ => {}
        }
        polled
    }
}
