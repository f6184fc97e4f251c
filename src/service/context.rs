//! Per-request state threaded through the executor and entity sets.

use crate::service::registry::ServiceRegistry;
use serde_json::Value;
use std::sync::Arc;

pub struct RequestContext {
    pub tenant: String,
    /// Sticky session id sent by the client.
    pub context_id: Option<String>,
    pub user: String,
    pub services: Option<Arc<ServiceRegistry>>,
    /// Extra response headers collected while serving the request.
    pub response_headers: Vec<(String, String)>,
    /// Diagnostic messages for the `sap-messages` header.
    pub messages: Vec<Value>,
}

impl RequestContext {
    pub fn new(tenant: impl Into<String>, user: impl Into<String>) -> Self {
        RequestContext {
            tenant: tenant.into(),
            context_id: None,
            user: user.into(),
            services: None,
            response_headers: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_context_id(mut self, context_id: Option<String>) -> Self {
        self.context_id = context_id;
        self
    }

    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    /// Set a response header, replacing an earlier value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.response_headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.response_headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
