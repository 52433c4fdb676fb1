pub mod routes;
pub mod stream;

use crate::state::ServiceState;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn router(state: ServiceState) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Run control
        .route(
            "/v1/runs",
            get(routes::get_run)
                .post(routes::start_run)
                .delete(routes::stop_run),
        )
        .route(
            "/v1/thresholds",
            get(routes::get_thresholds).put(routes::update_thresholds),
        )
        .route("/v1/frame", get(routes::latest_frame))
        // Dashboard endpoints
        .route("/api/recent_counts", get(routes::recent_counts))
        .route("/api/recent_alerts", get(routes::recent_alerts))
        .route("/video_feed", get(stream::video_feed))
        .route("/ws", get(stream::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
