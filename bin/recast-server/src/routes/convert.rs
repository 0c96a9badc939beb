//! Image conversion route.
//!
//! `POST /convert` takes a multipart form with a `file` and a target
//! `format`, runs the conversion pipeline and streams the converted image
//! back. Progress is reported under the job id echoed in `X-Job-Id`.

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::{Bytes, BytesMut};
use recast_core::{Conversion, ImageFormat, PipelineError, UploadedAsset, ValidationError};
use tracing::{debug, info};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::ConvertQuery;
use crate::state::AppState;

pub const X_JOB_ID: &str = "x-job-id";

/// Room for multipart boundaries, part headers and the `format` field on top
/// of the file itself.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(OpenApi)]
#[openapi(paths(convert))]
pub struct ConvertApi;

pub fn router(state: &AppState) -> Router<Arc<AppState>> {
    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD)
        .try_into()
        .unwrap_or(usize::MAX);
    Router::new().route(
        "/convert",
        post(convert)
            .fallback(super::method_not_allowed)
            .layer(DefaultBodyLimit::max(body_limit)),
    )
}

/// Convert an uploaded image.
///
/// The upload must carry an allowed extension whose content sniff and magic
/// bytes agree with it; SVG input is additionally scanned for script. The
/// response body is the converted file.
#[utoipa::path(
    post,
    path = "/convert",
    tag = "convert",
    params(ConvertQuery),
    request_body(content = crate::schemas::ConvertForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Converted image", content_type = "application/octet-stream",
            headers(("X-Job-Id" = String, description = "Job id to poll at /progress"))),
        (status = 400, description = "Invalid upload, mismatched content or unsupported format", body = String),
        (status = 405, description = "Method other than POST", body = String),
        (status = 500, description = "Scratch storage fault", body = String),
    )
)]
pub async fn convert(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConvertQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ServerError> {
    let pipeline = &state.pipeline;
    let mut job = pipeline.begin(query.id.as_deref())?;
    let job_id = job.id().to_owned();

    let form = match multipart {
        Ok(multipart) => read_form(multipart, pipeline.config().max_upload_bytes).await,
        Err(rejection) => Err(PipelineError::BadRequest(rejection.body_text())),
    };
    let (asset, target) = match form {
        Ok(form) => form,
        Err(e) => {
            job.reject(&e).await;
            return Err(e.into());
        }
    };
    job.form_parsed();
    debug!(job_id = %job_id, filename = %asset.filename(), bytes = asset.size(), %target, "form parsed");

    let Conversion {
        job: record,
        download_name,
        content_type,
        content_length,
        reader,
    } = pipeline.run(&mut job, asset, target).await?;
    info!(
        job_id = %job_id,
        source = %record.source_format,
        target = %record.target_format,
        bytes = content_length,
        "streaming converted image"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{download_name}\""),
        )
        .header(header::CONTENT_LENGTH, content_length)
        .header(X_JOB_ID, &job_id)
        .body(Body::from_stream(job.stream(reader)))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Read the `file` and `format` fields. The file is counted while it
/// streams in and refused as soon as it passes `max_bytes`.
async fn read_form(
    mut multipart: Multipart,
    max_bytes: u64,
) -> Result<(UploadedAsset, ImageFormat), PipelineError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut target: Option<ImageFormat> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_owned();
                let content = read_capped(field, max_bytes).await?;
                file = Some((filename, content));
            }
            Some("format") => {
                let value = field.text().await.map_err(multipart_error)?;
                let value = value.trim();
                let format = ImageFormat::from_str(value).map_err(|_| {
                    PipelineError::BadRequest(format!("unsupported output format: {value:?}"))
                })?;
                target = Some(format);
            }
            _ => {}
        }
    }

    let (filename, content) =
        file.ok_or_else(|| PipelineError::BadRequest("missing form field: file".to_owned()))?;
    let target =
        target.ok_or_else(|| PipelineError::BadRequest("missing form field: format".to_owned()))?;
    Ok((UploadedAsset::from_bytes(&filename, content), target))
}

async fn read_capped(mut field: Field<'_>, max_bytes: u64) -> Result<Bytes, PipelineError> {
    let mut content = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        let size = (content.len() + chunk.len()) as u64;
        if size > max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: max_bytes,
            }
            .into());
        }
        content.extend_from_slice(&chunk);
    }
    Ok(content.freeze())
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> PipelineError {
    PipelineError::BadRequest(format!("failed to read multipart form: {}", e.body_text()))
}
