//! Mock data contributors: optional per-entity-set overrides with default behavior.

use crate::config::{Action, EntitySetDef, ServiceSchema};
use crate::error::AppError;
use crate::service::registry::ServiceRegistry;
use crate::store::{EntityStore, KeyMap, Record};
use async_trait::async_trait;
use serde_json::Value;

/// What an override sees of the request it serves, plus direct access to the tenant's rows.
pub struct ContributorContext<'a> {
    pub tenant: &'a str,
    /// `None` for container-level (unbound) actions.
    pub entity_set: Option<&'a EntitySetDef>,
    pub schema: &'a ServiceSchema,
    pub services: Option<&'a ServiceRegistry>,
    pub(crate) store: &'a EntityStore,
}

impl<'a> ContributorContext<'a> {
    fn set(&self, name: Option<&str>) -> Result<&'a EntitySetDef, AppError> {
        match name {
            Some(n) => self
                .schema
                .entity_set(n)
                .map(|s| s.as_ref())
                .ok_or_else(|| AppError::NotFound(format!("entity set {}", n))),
            None => self
                .entity_set
                .ok_or_else(|| AppError::Internal("no entity set in contributor context".into())),
        }
    }

    /// Rows of this entity set (or `set_name`) matching `keys`.
    pub async fn fetch(&self, set_name: Option<&str>, keys: &KeyMap) -> Result<Vec<Record>, AppError> {
        let set = self.set(set_name)?;
        self.store.read(self.tenant, set, self.schema, |c| c.fetch(keys)).await
    }

    pub async fn add(&self, set_name: Option<&str>, row: Record) -> Result<(), AppError> {
        let set = self.set(set_name)?;
        self.store.write(self.tenant, set, self.schema, |c| c.add(row)).await?
    }

    pub async fn update(&self, set_name: Option<&str>, keys: &KeyMap, patch: &Record) -> Result<Option<Record>, AppError> {
        let set = self.set(set_name)?;
        self.store.write(self.tenant, set, self.schema, |c| c.update(keys, patch)).await
    }

    pub async fn remove(&self, set_name: Option<&str>, keys: &KeyMap) -> Result<usize, AppError> {
        let set = self.set(set_name)?;
        self.store.write(self.tenant, set, self.schema, |c| c.remove(keys)).await
    }
}

/// Override points for one entity set (or the entity container). Every method has a default, so an
/// implementation only provides what it changes.
#[async_trait]
pub trait MockDataContributor: Send + Sync {
    /// Rows to serve instead of the stored ones; `None` keeps the store.
    async fn fetch_entries(&self, _keys: &KeyMap, _ctx: &ContributorContext<'_>) -> Result<Option<Vec<Record>>, AppError> {
        Ok(None)
    }

    /// Result of a non-draft, non-sticky action. Unimplemented by default.
    async fn execute_action(
        &self,
        action: &Action,
        _keys: &KeyMap,
        _params: &Value,
        _ctx: &ContributorContext<'_>,
    ) -> Result<Option<Value>, AppError> {
        Err(AppError::NotImplemented(format!("action {}", action.name)))
    }

    /// May rewrite or reject a patch before it is merged.
    async fn on_before_update(&self, _keys: &KeyMap, _patch: &mut Record, _ctx: &ContributorContext<'_>) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_after_update(&self, _row: &Record, _ctx: &ContributorContext<'_>) -> Result<(), AppError> {
        Ok(())
    }

    fn has_custom_aggregate(&self, _name: &str) -> bool {
        false
    }

    /// Value of a custom aggregate; `None` falls back to a sum.
    fn perform_custom_aggregate(&self, _name: &str, _rows: &[Record]) -> Option<Value> {
        None
    }
}

/// Contributor that keeps every default.
pub struct DefaultContributor;

#[async_trait]
impl MockDataContributor for DefaultContributor {}
