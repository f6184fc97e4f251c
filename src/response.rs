//! Dialect envelopes: wraps an [`ODataResult`] in the V2 (`{"d": ...}`) or V4 (`@odata.*`) shape.

use crate::config::ODataVersion;
use crate::service::{ODataResult, RequestContext};
use crate::tenant::TENANT_ID_HEADER;
use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Response headers naming the protocol version.
pub fn version_header(version: ODataVersion) -> (&'static str, &'static str) {
    match version {
        ODataVersion::V2 => ("dataserviceversion", "2.0"),
        ODataVersion::V4 => ("odata-version", "4.0"),
    }
}

/// JSON body for a result, or `None` for results without a JSON body.
pub fn envelope(result: &ODataResult, version: ODataVersion, service_path: &str) -> Option<Value> {
    let context_url = |context: &str| format!("{}/$metadata#{}", service_path, context);
    match (result, version) {
        (ODataResult::Collection { rows, count, .. }, ODataVersion::V2) => {
            let mut d = json!({ "results": rows });
            if let Some(count) = count {
                d["__count"] = Value::String(count.to_string());
            }
            Some(json!({ "d": d }))
        }
        (ODataResult::Collection { rows, count, context }, ODataVersion::V4) => {
            let mut body = json!({ "@odata.context": context_url(context) });
            if let Some(count) = count {
                body["@odata.count"] = json!(count);
            }
            body["value"] = json!(rows);
            Some(body)
        }
        (ODataResult::Entity { row, .. } | ODataResult::Created { row, .. }, ODataVersion::V2) => {
            Some(json!({ "d": row }))
        }
        (ODataResult::Entity { row, context } | ODataResult::Created { row, context }, ODataVersion::V4) => {
            let mut body = row.clone();
            body.insert("@odata.context".into(), Value::String(format!("{}/$entity", context_url(context))));
            Some(Value::Object(body))
        }
        (ODataResult::Property { name, value, .. }, ODataVersion::V2) => {
            let mut d = serde_json::Map::new();
            d.insert(name.clone(), value.clone());
            Some(json!({ "d": d }))
        }
        (ODataResult::Property { value, context, .. }, ODataVersion::V4) => {
            Some(json!({ "@odata.context": context_url(context), "value": value }))
        }
        (ODataResult::Raw(_) | ODataResult::NoContent, _) => None,
    }
}

/// Final HTTP response: status, envelope, protocol and tenant headers plus anything the request
/// context collected (sticky session headers, `sap-messages`).
pub fn render(result: ODataResult, version: ODataVersion, service_path: &str, ctx: &RequestContext, minimal: bool) -> Response {
    let mut response = match &result {
        ODataResult::NoContent => StatusCode::NO_CONTENT.into_response(),
        ODataResult::Created { .. } if minimal => StatusCode::NO_CONTENT.into_response(),
        ODataResult::Raw(text) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], text.clone()).into_response(),
        other => {
            let status = if matches!(other, ODataResult::Created { .. }) {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            let body = envelope(other, version, service_path).unwrap_or(Value::Null);
            (status, Json(body)).into_response()
        }
    };
    let headers = response.headers_mut();
    let (name, value) = version_header(version);
    headers.insert(name, HeaderValue::from_static(value));
    if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(TENANT_ID_HEADER.as_bytes()), HeaderValue::from_str(&ctx.tenant)) {
        headers.insert(n, v);
    }
    for (name, value) in &ctx.response_headers {
        if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(n, v);
        }
    }
    if !ctx.messages.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&Value::Array(ctx.messages.clone()).to_string()) {
            headers.insert("sap-messages", v);
        }
    }
    response
}
