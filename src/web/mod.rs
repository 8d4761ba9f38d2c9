//! HTTP surface: router, handlers and the route schema

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::params::Codec;
use crate::session::SessionManager;

pub mod handlers;
pub mod schema;

/// Process-wide state shared by every handler.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    /// Codec used when a stream request does not name one.
    pub default_codec: Codec,
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::index))
        .route("/api/schema", get(handlers::api_schema))
        .route("/device/list", get(handlers::device_list))
        .route("/device/:device/caps", get(handlers::device_caps))
        .route("/stream/:device/stats", get(handlers::stream_stats))
        .route("/stream/:device/feedback", post(handlers::stream_feedback))
        .route("/stream/live/:device", get(handlers::stream_live))
        .route("/stream/udp/:device", get(handlers::stream_udp))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
