//! HTTP router and handlers

use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, routing::any};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use super::forward::{ForwardState, forward_request};

/// Body of the health path response
pub const HEALTH_BODY: &str = "Hello World!";

/// Create the router.
///
/// `health_path` (and its trailing-slash form) answers every method with
/// [`HEALTH_BODY`]. Everything else is forwarded. Bodies larger than
/// `max_body_size` bytes are refused with 413 before any handler runs.
pub fn create_router(state: Arc<ForwardState>, health_path: &str, max_body_size: usize) -> Router {
    let mut router = Router::new().route(health_path, any(health_handler));

    let trailing = format!("{}/", health_path.trim_end_matches('/'));
    if trailing != health_path {
        router = router.route(&trailing, any(health_handler));
    }

    router
        .fallback(forward_request)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health path handler
async fn health_handler() -> &'static str {
    HEALTH_BODY
}
