//! Route table

use super::handlers;
use super::ApiState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/changes", get(handlers::list_changes))
        .route("/api/v1/alerts", get(handlers::list_alerts))
        .route(
            "/api/v1/alerts/:id/acknowledge",
            post(handlers::acknowledge_alert),
        )
        .route("/api/v1/alerts/:id/resolve", post(handlers::resolve_alert))
        .route("/api/v1/alert-rules", get(handlers::list_alert_rules))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
