#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use odata_mockserver::{app, AppState, DataAccess, FsFileLoader, MockServerSettings, ServiceRegistry};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;

pub fn fixture(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(path)
}

pub async fn service(config: &str, service_path: &str, data_dir: PathBuf) -> DataAccess {
    let settings = MockServerSettings {
        service_path: service_path.to_string(),
        service_config: Some(fixture(config)),
        mock_data_dir: Some(data_dir),
        generate_mock_data: false,
        ..Default::default()
    };
    DataAccess::load(&settings, Arc::new(FsFileLoader)).await.unwrap().build()
}

pub async fn sales() -> DataAccess {
    service("sales/service.json", "/sales", fixture("sales/data")).await
}

pub fn router(services: Vec<DataAccess>) -> Router {
    let mut registry = ServiceRegistry::new();
    for s in services {
        registry.register(Arc::new(s), &[]);
    }
    app(AppState::new(registry, MockServerSettings::default()))
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
    pub text: String,
}

pub async fn send(app: &Router, method: &str, uri: &str, headers: &[(&str, &str)], body: Option<Value>) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&bytes).to_string();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Reply {
        status,
        headers,
        body,
        text,
    }
}

pub async fn get(app: &Router, uri: &str) -> Reply {
    send(app, "GET", uri, &[], None).await
}
