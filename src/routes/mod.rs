use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

pub mod control;
pub mod files;
pub mod health;

const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 512;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());

    let queue_routes = Router::new()
        .route("/status", get(control::queue_status))
        .route("/start", post(control::start_queue))
        .route("/stop", post(control::stop_queue))
        .route("/recover", post(control::recover_jobs));

    let organization_routes = Router::new()
        .route("/:org/files", post(files::upload_file))
        .route("/:org/sync", post(control::sync_organization))
        .route("/:org/reindex", post(control::reindex_organization));

    let file_routes = Router::new()
        .route("/:id", delete(files::delete_file))
        .route("/:id/status", get(files::file_status))
        .route("/:id/download", get(files::download_file));

    Router::new()
        .nest("/api/queues", queue_routes)
        .nest("/api/organizations", organization_routes)
        .nest("/api/files", file_routes)
        .route("/api/search/health", get(control::search_health))
        .route(
            "/api/extraction-jobs/:id/reset",
            post(control::reset_extraction_job),
        )
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

fn cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed_origins {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = value, "ignoring invalid CORS allowed origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}
