mod common;
mod odata;

pub use common::common_routes;
pub use odata::{odata_routes, MAX_BODY_BYTES};

use crate::state::AppState;
use axum::Router;

/// Full application: common routes plus every registered OData service.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(common_routes(state.clone()))
        .merge(odata_routes(state))
}
