use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::ApiState;

pub fn create_router(state: Arc<ApiState>) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.request_timeout_secs,
        )));

    Router::new()
        .route("/api/usage/record", post(handlers::record_usage))
        .route("/api/usage/reduce", post(handlers::reduce_usage))
        .route("/api/usage/check", post(handlers::check_usage))
        .route("/api/usage/remaining", post(handlers::remaining_units))
        .route("/api/usage/snapshot", post(handlers::usage_snapshot))
        .route("/api/usage/purge", post(handlers::purge_expired))
        .route(
            "/api/limits/overrides",
            put(handlers::set_override).delete(handlers::remove_override),
        )
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(middleware)
}
