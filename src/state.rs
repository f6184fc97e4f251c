//! Shared application state for all routes.

use crate::config::MockServerSettings;
use crate::service::ServiceRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceRegistry>,
    pub settings: Arc<MockServerSettings>,
}

impl AppState {
    pub fn new(services: ServiceRegistry, settings: MockServerSettings) -> Self {
        AppState {
            services: Arc::new(services),
            settings: Arc::new(settings),
        }
    }
}
