//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use recast_core::{ConversionPipeline, FsScratch};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Conversion pipeline over the on-disk scratch directories. Owns the
    /// progress store polled by `/progress`.
    pub pipeline: Arc<ConversionPipeline<FsScratch>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let scratch = FsScratch::new(&config.upload_dir, &config.converted_dir);
        let pipeline = ConversionPipeline::new(config.pipeline(), scratch);
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
        }
    }
}
