//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - `/convert` and `/progress`
//! - Health route
//! - Optional OpenAPI document (disable with `RECAST_ENABLE_DOCS=false`)

pub mod convert;
pub mod doc;
mod health;
mod progress;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Json, Router};
use tower::ServiceBuilder;

use crate::error::ServerError;
use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(convert::router(&state))
        .merge(progress::router())
        .merge(health::router());

    if state.config.enable_docs {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || {
                let api_doc = api_doc.clone();
                async move { Json(api_doc) }
            }),
        );
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

/// Plain-text 405 for routes hit with the wrong method.
async fn method_not_allowed() -> ServerError {
    ServerError::MethodNotAllowed
}

// ── Tests ──────────────────────────────────────────────────────────────────────
