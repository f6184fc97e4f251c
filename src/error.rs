//! Typed errors and HTTP mapping.

use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid key: entity type {entity_type} has no property {property}")]
    InvalidKey { entity_type: String, property: String },
    #[error("duplicate entity set: {0}")]
    DuplicateEntitySet(String),
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("settings: {0}")]
    Settings(String),
}

/// Error raised on purpose by mock data logic, carrying its own status and presentation.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ExecutionError {
    pub status: u16,
    pub message: String,
    /// Replaces the default `{error:{...}}` body when present.
    pub payload: Option<serde_json::Value>,
    /// Report through the `sap-messages` header instead of an error body.
    pub is_sap_message: bool,
    pub headers: Vec<(String, String)>,
}

impl ExecutionError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        ExecutionError {
            status,
            message: message.into(),
            payload: None,
            is_sap_message: false,
            headers: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn as_sap_message(mut self) -> Self {
        self.is_sap_message = true;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Execution(e) => {
                StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn error_json(code: &str, message: String) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: ErrorDetail {
            code: code.to_string(),
            message,
            details: None,
        },
    })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Execution(e) => {
                let mut response = if e.is_sap_message {
                    let messages = serde_json::json!([{
                        "code": status.as_u16().to_string(),
                        "message": e.message,
                        "numericSeverity": 4,
                    }]);
                    let mut r = status.into_response();
                    if let Ok(v) = HeaderValue::from_str(&messages.to_string()) {
                        r.headers_mut().insert("sap-messages", v);
                    }
                    r
                } else if let Some(payload) = e.payload {
                    (status, Json(payload)).into_response()
                } else {
                    (status, error_json("execution_error", e.message)).into_response()
                };
                for (name, value) in e.headers {
                    if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                        response.headers_mut().insert(n, v);
                    }
                }
                response
            }
            AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                (status, self.to_string()).into_response()
            }
            AppError::NotFound(_) => (status, error_json("not_found", self.to_string())).into_response(),
            AppError::BadRequest(_) => (status, error_json("bad_request", self.to_string())).into_response(),
            AppError::Conflict(_) => (status, error_json("conflict", self.to_string())).into_response(),
            AppError::NotImplemented(_) => {
                (status, error_json("not_implemented", self.to_string())).into_response()
            }
        }
    }
}
