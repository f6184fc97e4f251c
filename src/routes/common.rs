//! Operational routes: liveness, readiness over the registered services, build info.

use crate::config::ODataVersion;
use crate::service::DataAccess;
use crate::state::AppState;
use crate::tenant::DEFAULT_TENANT;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Serialize)]
struct ServiceSummary {
    path: String,
    odata_version: &'static str,
    entity_sets: usize,
    has_metadata: bool,
}

impl ServiceSummary {
    fn of(service: &DataAccess) -> Self {
        ServiceSummary {
            path: service.service_path().to_string(),
            odata_version: match service.version() {
                ODataVersion::V2 => "2.0",
                ODataVersion::V4 => "4.0",
            },
            entity_sets: service.schema().entity_sets.len(),
            has_metadata: service.metadata_document().is_some(),
        }
    }
}

#[derive(Serialize)]
struct Readiness {
    status: &'static str,
    services: Vec<ServiceSummary>,
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "services": state.services.len() }))
}

/// 503 until at least one service is registered.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let services: Vec<ServiceSummary> = state.services.iter().map(|s| ServiceSummary::of(s)).collect();
    if services.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Readiness {
                status: "no services registered",
                services,
            }),
        );
    }
    (StatusCode::OK, Json(Readiness { status: "ok", services }))
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    let settings = &state.settings;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "default_tenant": DEFAULT_TENANT,
        "default_user": settings.default_user,
        "strict_key_mode": settings.strict_key_mode,
        "generate_mock_data": settings.generate_mock_data,
        "sticky_timeout_secs": settings.sticky_session_timeout.as_secs(),
    }))
}

/// GET /health, /ready and /info. `/version` is kept as an alias of `/info`.
pub fn common_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/info", get(info))
        .route("/version", get(info))
        .with_state(state)
}
