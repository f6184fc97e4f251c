//! Entity store: per-tenant, per-entity-set collections, materialized lazily from seed files or synthesized.

mod collection;
mod defaults;
mod tree;

pub use collection::{format_keys, key_tuple, looks_like_guid, loose_eq, row_matches, unwrap_literal, EntityCollection};
pub use defaults::{empty_row, generate_key, generate_rows, GENERATED_ROW_COUNT};
pub use tree::{node_id, DrillState, FlattenOptions, HierarchyTree, TreeNode};

use crate::config::{EntitySetDef, MockServerSettings, ServiceSchema};
use crate::error::AppError;
use crate::files::FileLoader;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// One entity instance.
pub type Record = serde_json::Map<String, Value>;

/// Key predicate: property name -> literal. The empty name stands for the entity type's single default key.
pub type KeyMap = BTreeMap<String, Value>;

pub const DEFAULT_KEY: &str = "";

/// Where a collection's initial rows came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSource {
    Seed,
    Generated,
    Empty,
}

pub struct EntityStore {
    loader: Arc<dyn FileLoader>,
    mock_data_dir: Option<PathBuf>,
    generate_mock_data: bool,
    /// Seed rows per entity set, read once and cloned into every tenant.
    seeds: RwLock<HashMap<String, Option<Arc<Vec<Record>>>>>,
    tenants: RwLock<HashMap<String, HashMap<String, EntityCollection>>>,
}

impl EntityStore {
    pub fn new(loader: Arc<dyn FileLoader>, settings: &MockServerSettings) -> Self {
        EntityStore {
            loader,
            mock_data_dir: settings.mock_data_dir.clone(),
            generate_mock_data: settings.generate_mock_data,
            seeds: RwLock::new(HashMap::new()),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Run `f` against the tenant's collection, materializing it first if needed.
    pub async fn read<R>(
        &self,
        tenant: &str,
        set: &EntitySetDef,
        schema: &ServiceSchema,
        f: impl FnOnce(&EntityCollection) -> R,
    ) -> Result<R, AppError> {
        self.ensure(tenant, set, schema).await?;
        let guard = self.tenants.read().map_err(|_| lock_poisoned())?;
        let collection = guard
            .get(tenant)
            .and_then(|t| t.get(&set.name))
            .ok_or_else(|| AppError::Internal(format!("collection {} vanished", set.name)))?;
        Ok(f(collection))
    }

    /// Mutable access to the tenant's collection, materializing it first if needed.
    pub async fn write<R>(
        &self,
        tenant: &str,
        set: &EntitySetDef,
        schema: &ServiceSchema,
        f: impl FnOnce(&mut EntityCollection) -> R,
    ) -> Result<R, AppError> {
        self.ensure(tenant, set, schema).await?;
        let mut guard = self.tenants.write().map_err(|_| lock_poisoned())?;
        let collection = guard
            .get_mut(tenant)
            .and_then(|t| t.get_mut(&set.name))
            .ok_or_else(|| AppError::Internal(format!("collection {} vanished", set.name)))?;
        Ok(f(collection))
    }

    /// Drop all collections of one tenant; they re-materialize on next access.
    pub fn reset_tenant(&self, tenant: &str) -> Result<(), AppError> {
        let mut guard = self.tenants.write().map_err(|_| lock_poisoned())?;
        guard.remove(tenant);
        Ok(())
    }

    async fn ensure(&self, tenant: &str, set: &EntitySetDef, schema: &ServiceSchema) -> Result<(), AppError> {
        {
            let guard = self.tenants.read().map_err(|_| lock_poisoned())?;
            if guard.get(tenant).map(|t| t.contains_key(&set.name)).unwrap_or(false) {
                return Ok(());
            }
        }
        let (rows, source) = self.initial_rows(set, schema).await?;
        let rows = if set.is_draft() { rows.into_iter().map(with_draft_defaults).collect() } else { rows };
        let count = rows.len();
        let mut guard = self.tenants.write().map_err(|_| lock_poisoned())?;
        let sets = guard.entry(tenant.to_string()).or_default();
        if !sets.contains_key(&set.name) {
            sets.insert(set.name.clone(), EntityCollection::new(set.entity_type.keys.clone(), rows));
            tracing::debug!(entity_set = %set.name, tenant = %tenant, rows = count, source = ?source, "collection materialized");
        }
        Ok(())
    }

    async fn initial_rows(&self, set: &EntitySetDef, schema: &ServiceSchema) -> Result<(Vec<Record>, DataSource), AppError> {
        if let Some(seed) = self.seed(&set.name).await? {
            return Ok((seed.as_ref().clone(), DataSource::Seed));
        }
        if self.generate_mock_data {
            let count = if set.singleton { 1 } else { GENERATED_ROW_COUNT };
            return Ok((generate_rows(set, schema, count), DataSource::Generated));
        }
        Ok((Vec::new(), DataSource::Empty))
    }

    async fn seed(&self, set_name: &str) -> Result<Option<Arc<Vec<Record>>>, AppError> {
        {
            let guard = self.seeds.read().map_err(|_| lock_poisoned())?;
            if let Some(cached) = guard.get(set_name) {
                return Ok(cached.clone());
            }
        }
        let loaded = match &self.mock_data_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.json", set_name));
                if self.loader.exists(&path).await {
                    let text = self.loader.read_text(&path).await?;
                    Some(Arc::new(parse_seed(set_name, &text)?))
                } else {
                    None
                }
            }
            None => None,
        };
        let mut guard = self.seeds.write().map_err(|_| lock_poisoned())?;
        Ok(guard.entry(set_name.to_string()).or_insert(loaded).clone())
    }
}

/// Seed files hold a JSON array of rows, or an object with a `value` array.
fn parse_seed(set_name: &str, text: &str) -> Result<Vec<Record>, AppError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::Internal(format!("seed data for {}: {}", set_name, e)))?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("value") {
            Some(Value::Array(rows)) => rows,
            _ => vec![Value::Object(obj)],
        },
        _ => return Err(AppError::Internal(format!("seed data for {} must be an array", set_name))),
    };
    Ok(rows
        .into_iter()
        .filter_map(|r| match r {
            Value::Object(o) => Some(o),
            _ => None,
        })
        .collect())
}

fn with_draft_defaults(mut row: Record) -> Record {
    row.entry("IsActiveEntity").or_insert(Value::Bool(true));
    row.entry("HasActiveEntity").or_insert(Value::Bool(false));
    row.entry("HasDraftEntity").or_insert(Value::Bool(false));
    row
}

fn lock_poisoned() -> AppError {
    AppError::Internal("entity store lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ServiceConfig};
    use crate::files::MemoryFileLoader;
    use serde_json::json;

    fn schema() -> ServiceSchema {
        let config: ServiceConfig = serde_json::from_value(json!({
            "entity_types": [{
                "name": "Country",
                "keys": ["Country_Code"],
                "properties": [
                    { "name": "Country_Code", "type": "Edm.String", "max_length": 3, "nullable": false },
                    { "name": "Name", "type": "Edm.String" }
                ]
            }],
            "entity_sets": [{ "name": "Countries", "entity_type": "Country" }, { "name": "Others", "entity_type": "Country" }]
        }))
        .unwrap();
        resolve(&config).unwrap()
    }

    fn settings(dir: Option<&str>) -> MockServerSettings {
        MockServerSettings {
            mock_data_dir: dir.map(PathBuf::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seed_is_cloned_per_tenant() {
        let loader = MemoryFileLoader::new().with_file(
            "/data/Countries.json",
            r#"[{"Country_Code":"FR","Name":"France"},{"Country_Code":"DE","Name":"Germany"}]"#,
        );
        let store = EntityStore::new(Arc::new(loader), &settings(Some("/data")));
        let schema = schema();
        let set = schema.entity_set("Countries").unwrap().clone();
        store
            .write("tenant-a", &set, &schema, |c| c.remove(&[("Country_Code".to_string(), json!("FR"))].into()))
            .await
            .unwrap();
        let a = store.read("tenant-a", &set, &schema, |c| c.len()).await.unwrap();
        let b = store.read("tenant-b", &set, &schema, |c| c.len()).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn missing_seed_generates_rows() {
        let store = EntityStore::new(Arc::new(MemoryFileLoader::new()), &settings(Some("/data")));
        let schema = schema();
        let set = schema.entity_set("Others").unwrap().clone();
        let rows = store.read("t", &set, &schema, |c| c.all_rows()).await.unwrap();
        assert_eq!(rows.len(), GENERATED_ROW_COUNT);
        assert!(rows.iter().all(|r| r["Country_Code"].as_str().unwrap().len() <= 3));
    }
}
