use axum::http::{HeaderName, HeaderValue};
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::trace::X_TRACE_ID;
use crate::routes::convert::X_JOB_ID;
use crate::state::AppState;

pub fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_allowed_origins
        .as_deref()
        .map(|list| list.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default();

    // Cross-origin scripts can only read exposed headers.
    let exposed = [
        HeaderName::from_static(X_JOB_ID),
        HeaderName::from_static(X_TRACE_ID),
        axum::http::header::CONTENT_DISPOSITION,
    ];

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .expose_headers(exposed);
    if origins.is_empty() {
        // Wildcard; set RECAST_CORS_ORIGINS in production.
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}
