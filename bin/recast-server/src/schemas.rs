//! Request and response shapes shared by the routes and the OpenAPI document.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Query parameters of `POST /convert`.
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ConvertQuery {
    /// Job id to report progress under: 1 to 64 letters, digits, `-` or `_`.
    /// A random id is generated when omitted; either way it is returned in
    /// the `X-Job-Id` response header.
    pub id: Option<String>,
}

/// Multipart form accepted by `POST /convert`. Only used for the document;
/// the handler reads the form as a stream.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct ConvertForm {
    /// Image to convert (png, jpg, jpeg, gif, bmp, tif, tiff, webp, svg, psd).
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// Target format: one of jpg, png, webp, gif, bmp.
    pub format: String,
}

/// Query parameters of `GET /progress`.
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ProgressQuery {
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Jobs in flight plus finished jobs still pollable.
    pub active_jobs: usize,
    pub input_formats: Vec<String>,
    pub output_formats: Vec<String>,
}
