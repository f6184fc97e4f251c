//! Catch-all OData handler: finds the owning service by path prefix and executes the request.

use crate::error::AppError;
use crate::extractors::TenantId;
use crate::query::ODataRequest;
use crate::response::{render, version_header};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

pub async fn odata_handler(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (service, rest) = state
        .services
        .resolve_path(uri.path())
        .ok_or_else(|| AppError::NotFound(format!("no service at {}", uri.path())))?;
    let rest = rest.trim_matches('/');

    if rest.is_empty() {
        return Ok(with_version(Json(service.service_document()).into_response(), service.version()));
    }
    if rest == "$metadata" {
        let document = service
            .metadata_document()
            .ok_or_else(|| AppError::NotFound("no $metadata document configured".into()))?;
        let response = ([("content-type", "application/xml")], document.to_string()).into_response();
        return Ok(with_version(response, service.version()));
    }
    if rest == "$batch" {
        return Err(AppError::NotImplemented("$batch".into()));
    }

    let body: Option<Value> = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?)
    };
    let request = ODataRequest::parse(method, rest, uri.query(), &headers, tenant.clone(), body)?;
    let mut ctx = service
        .new_context(tenant)
        .with_context_id(request.context_id.clone())
        .with_services(state.services.clone());

    tracing::info!(
        method = %request.method,
        service_path = %service.service_path(),
        path = %rest,
        tenant = %ctx.tenant,
        "request received"
    );
    let result = service.handle(&request, &mut ctx).await?;
    let minimal = request.prefer_minimal && request.method != Method::GET;
    Ok(render(result, service.version(), service.service_path(), &ctx, minimal))
}

fn with_version(mut response: Response, version: crate::config::ODataVersion) -> Response {
    let (name, value) = version_header(version);
    response.headers_mut().insert(name, HeaderValue::from_static(value));
    response
}
