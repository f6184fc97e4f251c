//! Entity set variants layered over the entity store: standard CRUD, draft and sticky.

use crate::config::{Action, DraftSettings, EdmType, EntitySetDef, EntityType, ServiceSchema};
use crate::error::AppError;
use crate::service::context::RequestContext;
use crate::service::contributor::{ContributorContext, MockDataContributor};
use crate::service::navigation::{is_active, IS_ACTIVE_ENTITY};
use crate::service::sticky::StickySessions;
use crate::store::{empty_row, format_keys, generate_key, key_tuple, EntityStore, KeyMap, Record, DEFAULT_KEY};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub enum SetVariant {
    Standard,
    Draft(DraftSettings),
    Sticky(StickySessions),
}

/// All entity sets of one service, by name.
#[derive(Default)]
pub struct EntitySets {
    sets: HashMap<String, Arc<MockEntitySet>>,
}

impl EntitySets {
    pub fn new(sets: HashMap<String, Arc<MockEntitySet>>) -> Self {
        EntitySets { sets }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MockEntitySet>> {
        self.sets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MockEntitySet>> {
        self.sets.values()
    }
}

pub struct MockEntitySet {
    pub def: Arc<EntitySetDef>,
    pub(crate) schema: Arc<ServiceSchema>,
    pub(crate) store: Arc<EntityStore>,
    pub(crate) contributor: Arc<dyn MockDataContributor>,
    pub(crate) variant: SetVariant,
    pub(crate) strict_key_mode: bool,
    pub(crate) siblings: Weak<EntitySets>,
}

impl MockEntitySet {
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.def.entity_type
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.variant, SetVariant::Draft(_))
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self.variant, SetVariant::Sticky(_))
    }

    pub fn sticky_sessions(&self) -> Option<&StickySessions> {
        match &self.variant {
            SetVariant::Sticky(s) => Some(s),
            _ => None,
        }
    }

    pub fn contributor(&self) -> &Arc<dyn MockDataContributor> {
        &self.contributor
    }

    pub(crate) fn sibling(&self, name: &str) -> Result<Arc<MockEntitySet>, AppError> {
        let sets = self
            .siblings
            .upgrade()
            .ok_or_else(|| AppError::Internal("entity set registry dropped".into()))?;
        sets.get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("entity set {}", name)))
    }

    pub(crate) fn contributor_context<'a>(&'a self, ctx: &'a RequestContext) -> ContributorContext<'a> {
        ContributorContext {
            tenant: &ctx.tenant,
            entity_set: Some(&self.def),
            schema: &self.schema,
            services: ctx.services.as_deref(),
            store: &self.store,
        }
    }

    /// Resolve the default key, and coerce literals to the declared key types.
    pub fn normalize_keys(&self, keys: &KeyMap) -> KeyMap {
        let entity_type = self.entity_type();
        keys.iter()
            .map(|(name, value)| {
                let name = if name == DEFAULT_KEY {
                    entity_type
                        .business_keys()
                        .next()
                        .cloned()
                        .unwrap_or_else(|| name.clone())
                } else {
                    name.clone()
                };
                let value = match entity_type.property(&name) {
                    Some(p) => coerce_value(p.edm_type, value),
                    None if name == IS_ACTIVE_ENTITY => coerce_value(EdmType::Boolean, value),
                    None => value.clone(),
                };
                (name, value)
            })
            .collect()
    }

    /// Key tuple of a stored row.
    pub fn keys_of(&self, row: &Record) -> KeyMap {
        key_tuple(&self.entity_type().keys, row)
    }

    /// Business keys of a row plus an explicit `IsActiveEntity`.
    pub(crate) fn version_keys(&self, row: &Record, active: bool) -> KeyMap {
        let mut keys: KeyMap = self
            .entity_type()
            .business_keys()
            .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        keys.insert(IS_ACTIVE_ENTITY.to_string(), Value::Bool(active));
        keys
    }

    /// Stored rows, bypassing sessions and contributors.
    pub(crate) async fn fetch_raw(&self, tenant: &str, keys: &KeyMap) -> Result<Vec<Record>, AppError> {
        self.store.read(tenant, &self.def, &self.schema, |c| c.fetch(keys)).await
    }

    pub(crate) async fn all_raw(&self, tenant: &str) -> Result<Vec<Record>, AppError> {
        self.store.read(tenant, &self.def, &self.schema, |c| c.all_rows()).await
    }

    pub(crate) async fn insert_raw(&self, tenant: &str, row: Record) -> Result<(), AppError> {
        self.store.write(tenant, &self.def, &self.schema, |c| c.add(row)).await?
    }

    pub(crate) async fn patch_raw(&self, tenant: &str, keys: &KeyMap, patch: &Record) -> Result<Option<Record>, AppError> {
        self.store.write(tenant, &self.def, &self.schema, |c| c.update(keys, patch)).await
    }

    pub(crate) async fn replace_raw(&self, tenant: &str, keys: &KeyMap, row: Record) -> Result<bool, AppError> {
        self.store.write(tenant, &self.def, &self.schema, |c| c.replace(keys, row)).await
    }

    pub(crate) async fn remove_raw(&self, tenant: &str, keys: &KeyMap) -> Result<usize, AppError> {
        self.store.write(tenant, &self.def, &self.schema, |c| c.remove(keys)).await
    }

    /// Rows matching `keys`: the open sticky session first, then the contributor, then the store.
    pub async fn get(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<Vec<Record>, AppError> {
        let keys = self.normalize_keys(keys);
        if let Some(row) = self.sticky_read(ctx, &keys) {
            return Ok(vec![row]);
        }
        let contributed = {
            let cctx = self.contributor_context(ctx);
            self.contributor.fetch_entries(&keys, &cctx).await?
        };
        match contributed {
            Some(rows) => Ok(rows),
            None => self.fetch_raw(&ctx.tenant, &keys).await,
        }
    }

    /// Whole collection as the executor sees it (contributor override included).
    pub async fn all(&self, ctx: &mut RequestContext) -> Result<Vec<Record>, AppError> {
        self.get(ctx, &KeyMap::new()).await
    }

    /// Schema defaults merged with `data`; missing keys are generated.
    pub async fn create(&self, ctx: &mut RequestContext, data: Record) -> Result<Record, AppError> {
        let entity_type = self.entity_type().clone();
        let mut row = empty_row(&entity_type.properties, &self.schema);
        for (name, value) in data {
            let value = match entity_type.property(&name) {
                Some(p) => coerce_value(p.edm_type, &value),
                None => value,
            };
            row.insert(name, value);
        }
        if self.is_draft() {
            self.stamp_new_draft(ctx, &mut row);
        }
        let created = self
            .store
            .write(&ctx.tenant, &self.def, &self.schema, |c| {
                for key in &entity_type.keys {
                    let missing = row.get(key).map(Value::is_null).unwrap_or(true);
                    if missing {
                        if let Some(p) = entity_type.property(key) {
                            row.insert(key.clone(), generate_key(p, c));
                        }
                    }
                }
                c.add(row.clone()).map(|_| row)
            })
            .await??;
        tracing::debug!(entity_set = %self.def.name, tenant = %ctx.tenant, keys = %format_keys(&self.keys_of(&created)), "entity created");
        Ok(created)
    }

    /// Merge `patch` into the matching row (or the open sticky session object).
    pub async fn update(&self, ctx: &mut RequestContext, keys: &KeyMap, mut patch: Record) -> Result<Record, AppError> {
        let keys = self.normalize_keys(keys);
        let entity_type = self.entity_type().clone();
        for key in &entity_type.keys {
            patch.remove(key);
        }
        for (name, value) in patch.iter_mut() {
            if let Some(p) = entity_type.property(name) {
                *value = coerce_value(p.edm_type, value);
            }
        }
        if let Some(row) = self.sticky_update(ctx, &keys, &patch) {
            return Ok(row);
        }
        {
            let cctx = self.contributor_context(ctx);
            self.contributor.on_before_update(&keys, &mut patch, &cctx).await?;
        }
        let updated = self
            .patch_raw(&ctx.tenant, &keys, &patch)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{}({})", self.def.name, format_keys(&keys))))?;
        if self.is_draft() && is_active(updated.get(IS_ACTIVE_ENTITY)) == Some(false) {
            self.touch_draft(ctx, &updated).await?;
        }
        {
            let cctx = self.contributor_context(ctx);
            self.contributor.on_after_update(&updated, &cctx).await?;
        }
        Ok(updated)
    }

    /// Remove the matching row. For draft sets this discards drafts and deletes active rows with their drafts.
    pub async fn delete(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<(), AppError> {
        let keys = self.normalize_keys(keys);
        if self.is_draft() {
            return self.draft_delete(ctx, &keys).await;
        }
        if self.sticky_discard_matching(ctx, &keys) {
            return Ok(());
        }
        let removed = self.remove_raw(&ctx.tenant, &keys).await?;
        if removed == 0 {
            return Err(AppError::NotFound(format!("{}({})", self.def.name, format_keys(&keys))));
        }
        Ok(())
    }

    /// True when the variant handles `name` itself (draft or sticky lifecycle actions).
    pub fn handles_action(&self, name: &str) -> bool {
        match &self.variant {
            SetVariant::Draft(d) => {
                name == d.activation_action
                    || name == d.edit_action
                    || name == d.prepare_action
                    || d.discard_action.as_deref() == Some(name)
            }
            SetVariant::Sticky(s) => s.handles(name),
            SetVariant::Standard => false,
        }
    }

    /// Run a bound action: lifecycle actions of the variant first, the contributor otherwise.
    pub async fn execute_action(
        &self,
        ctx: &mut RequestContext,
        name: &str,
        action: Option<&Action>,
        keys: &KeyMap,
        params: &Value,
    ) -> Result<Option<Value>, AppError> {
        let keys = self.normalize_keys(keys);
        match &self.variant {
            SetVariant::Draft(d) if self.handles_action(name) => {
                let d = d.clone();
                let row = if name == d.edit_action {
                    self.draft_edit(ctx, &keys).await?
                } else if name == d.activation_action {
                    self.draft_activate(ctx, &keys).await?
                } else if name == d.prepare_action {
                    self.draft_prepare(ctx, &keys).await?
                } else {
                    self.draft_discard(ctx, &keys, false).await?;
                    None
                };
                return Ok(row.map(Value::Object));
            }
            SetVariant::Sticky(_) if self.handles_action(name) => {
                return Ok(self.sticky_action(ctx, name, &keys, params).await?.map(Value::Object));
            }
            _ => {}
        }
        let action = action.ok_or_else(|| AppError::NotFound(format!("action {} on {}", name, self.def.name)))?;
        let cctx = self.contributor_context(ctx);
        let result = self.contributor.execute_action(action, &keys, params, &cctx).await;
        if let Err(AppError::NotImplemented(_)) = &result {
            tracing::warn!(action = %action.name, entity_set = %self.def.name, "action has no implementation");
        }
        result
    }
}

/// Coerce a JSON value to a declared primitive type where the conversion is lossless.
pub fn coerce_value(edm_type: EdmType, value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    match edm_type {
        EdmType::Boolean if s.eq_ignore_ascii_case("true") => Value::Bool(true),
        EdmType::Boolean if s.eq_ignore_ascii_case("false") => Value::Bool(false),
        t if t.is_integer() => s.trim().parse::<i64>().map(Value::from).unwrap_or_else(|_| value.clone()),
        EdmType::Double | EdmType::Single => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_keeps_decimals_as_strings() {
        assert_eq!(coerce_value(EdmType::Int32, &json!("42")), json!(42));
        assert_eq!(coerce_value(EdmType::Boolean, &json!("False")), json!(false));
        assert_eq!(coerce_value(EdmType::Decimal, &json!("1.50")), json!("1.50"));
        assert_eq!(coerce_value(EdmType::String, &json!("42")), json!("42"));
        assert_eq!(coerce_value(EdmType::Int32, &json!("abc")), json!("abc"));
    }
}
