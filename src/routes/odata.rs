//! OData routes. Service paths are configured at runtime, so everything not matched by the common
//! routes falls through to the prefix-resolving handler.

use crate::handlers::odata_handler;
use crate::state::AppState;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn odata_routes(state: AppState) -> Router {
    Router::new()
        .fallback(odata_handler)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}
