pub mod routes;

use crate::state::FaceIdState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use telemetry::CorrelationIdLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router
pub fn router(state: FaceIdState) -> Router {
    let body_limit = state.config().max_upload_bytes;

    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Face-ID login
        .route("/upload", post(routes::upload_video))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorrelationIdLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
