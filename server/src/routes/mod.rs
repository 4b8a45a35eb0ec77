//! API route handlers and router assembly

pub mod health;
pub mod model;
pub mod predict;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

/// Headroom over `upload.max_bytes` for multipart boundaries and headers
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.service.max_upload_bytes() + MULTIPART_OVERHEAD;

    let mut router = Router::new()
        .route("/predict", post(predict::predict))
        .route("/health", get(health::health_check))
        .route("/model/reload", post(model::reload_model))
        .layer(DefaultBodyLimit::max(body_limit));

    if let Some(dir) = &state.config.server.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    let cors_permissive = state.config.server.cors_permissive;
    let router = router
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_permissive {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}
