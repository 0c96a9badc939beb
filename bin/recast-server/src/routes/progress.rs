//! Progress polling route.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;

use crate::schemas::ProgressQuery;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_progress))]
pub struct ProgressApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/progress",
        get(get_progress).fallback(super::method_not_allowed),
    )
}

/// Current percentage of a conversion job as plain text (`0`–`100`).
///
/// Unknown, failed and expired jobs all read `0`.
#[utoipa::path(
    get,
    path = "/progress",
    tag = "convert",
    params(ProgressQuery),
    responses(
        (status = 200, description = "Job progress in percent", body = String, content_type = "text/plain")
    )
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> String {
    query
        .id
        .as_deref()
        .map_or(0, |id| state.pipeline.progress().query(id))
        .to_string()
}
