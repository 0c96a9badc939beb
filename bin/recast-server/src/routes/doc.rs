use utoipa::OpenApi;

use crate::routes::{convert, health, progress};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "recast-server",
        description = "Validated image conversion with progress polling",
        version = "0.1.0",
    ),
    tags(
        (name = "convert", description = "Upload, convert and poll"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(convert::ConvertApi::openapi());
    root.merge(progress::ProgressApi::openapi());
    root.merge(health::HealthApi::openapi());
    root
}
