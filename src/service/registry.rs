//! Registry of mock services, so one service's logic can read another's data.

use crate::error::AppError;
use crate::service::data_access::DataAccess;
use crate::store::{KeyMap, Record};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<DataAccess>>,
    /// Alias (or service path) -> index into `services`.
    names: HashMap<String, usize>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its path and any extra aliases. A later registration of the same
    /// alias wins.
    pub fn register(&mut self, service: Arc<DataAccess>, aliases: &[&str]) {
        let index = self.services.len();
        self.names.insert(service.service_path().to_string(), index);
        for alias in aliases {
            self.names.insert(alias.to_string(), index);
        }
        tracing::info!(service_path = %service.service_path(), aliases = ?aliases, "service registered");
        self.services.push(service);
    }

    pub fn service(&self, name: &str) -> Option<&Arc<DataAccess>> {
        self.names.get(name).map(|&i| &self.services[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataAccess>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Service owning `path` (longest matching service path) and the remainder after it.
    pub fn resolve_path<'p>(&self, path: &'p str) -> Option<(&Arc<DataAccess>, &'p str)> {
        self.services
            .iter()
            .filter_map(|s| {
                let prefix = s.service_path().trim_end_matches('/');
                let rest = path.strip_prefix(prefix)?;
                (rest.is_empty() || rest.starts_with('/')).then_some((s, rest, prefix.len()))
            })
            .max_by_key(|(_, _, len)| *len)
            .map(|(s, rest, _)| (s, rest))
    }

    /// Rows of `entity_set` in another service, for the same tenant.
    pub async fn read_entity_set(
        &self,
        tenant: &str,
        service: &str,
        entity_set: &str,
        keys: &KeyMap,
    ) -> Result<Vec<Record>, AppError> {
        let access = self
            .service(service)
            .ok_or_else(|| AppError::NotFound(format!("service {}", service)))?;
        access.read_entity_set(tenant, entity_set, keys).await
    }

    pub fn sweep_sticky_sessions(&self, now: Instant) -> usize {
        self.services.iter().map(|s| s.sweep_sticky_sessions(now)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, MockServerSettings, ServiceConfig};
    use crate::files::MemoryFileLoader;
    use crate::store::EntityStore;
    use serde_json::json;

    fn service(path: &str) -> Arc<DataAccess> {
        let config: ServiceConfig = serde_json::from_value(json!({
            "entity_types": [{ "name": "Product", "keys": ["ID"], "properties": [
                { "name": "ID", "type": "Edm.String" }, { "name": "Price", "type": "Edm.Int32" }
            ]}],
            "entity_sets": [{ "name": "Products", "entity_type": "Product" }]
        }))
        .unwrap();
        let loader = MemoryFileLoader::new().with_file("/data/Products.json", r#"[{"ID":"P1","Price":4},{"ID":"P2","Price":9}]"#);
        let settings = MockServerSettings {
            service_path: path.to_string(),
            mock_data_dir: Some("/data".into()),
            ..Default::default()
        };
        let schema = Arc::new(resolve(&config).unwrap());
        let store = Arc::new(EntityStore::new(Arc::new(loader), &settings));
        Arc::new(DataAccess::builder(schema, store, &settings).build())
    }

    #[test]
    fn longest_service_path_wins() {
        let mut registry = ServiceRegistry::new();
        registry.register(service("/odata"), &[]);
        registry.register(service("/odata/catalog"), &["catalog"]);
        let (found, rest) = registry.resolve_path("/odata/catalog/Products").unwrap();
        assert_eq!(found.service_path(), "/odata/catalog");
        assert_eq!(rest, "/Products");
        assert!(registry.resolve_path("/odatax/Products").is_none());
        assert!(registry.service("catalog").is_some());
    }

    #[tokio::test]
    async fn reads_across_services() {
        let mut registry = ServiceRegistry::new();
        registry.register(service("/odata/catalog"), &["catalog"]);
        let rows = registry
            .read_entity_set("t1", "catalog", "Products", &[("ID".to_string(), json!("P2"))].into())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Price"], json!(9));
        assert!(registry.read_entity_set("t1", "missing", "Products", &KeyMap::new()).await.is_err());
    }
}
