use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use crate::app_state::AppState;
use super::handlers::{find_profiles, get_profile, health_check, write_profile};

/// `max_payload_bytes` caps the body of a profile upload.
pub fn create_router(app_state: Arc<AppState>, max_payload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(|| async { "Profile Storage Server" }))
        .route("/health", get(health_check))
        .route("/api/0/profiles", get(find_profiles).post(write_profile))
        .route("/api/0/profiles/*id", get(get_profile))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .with_state(app_state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
