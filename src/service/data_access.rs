//! Query executor: resolves a parsed request against the entity sets of one service.

use crate::config::{
    load_schema, short_type_name, Action, EdmType, EntityType, MockServerSettings, NavigationProperty,
    ODataVersion, Property, ServiceSchema,
};
use crate::error::{AppError, ConfigError};
use crate::files::FileLoader;
use crate::query::{ExpandNode, ODataRequest, PathSegment, Query, SelectSet};
use crate::service::contained::ContainedEntitySet;
use crate::service::context::RequestContext;
use crate::service::contributor::{ContributorContext, DefaultContributor, MockDataContributor};
use crate::service::entity_set::{coerce_value, EntitySets, MockEntitySet, SetVariant};
use crate::service::evaluator::{evaluate, matches_search, EvalContext};
use crate::service::navigation::{
    carry_active_flag, child_assignments, is_active, target_keys, DRAFT_ADMINISTRATIVE_DATA, IS_ACTIVE_ENTITY,
    SIBLING_ENTITY,
};
use crate::service::sticky::StickySessions;
use crate::service::transform::{apply_pipeline, sort_rows, TransformContext};
use crate::store::{empty_row, looks_like_guid, unwrap_literal, EntityStore, KeyMap, Record};
use crate::tenant::SAP_CLIENT_PARAM;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Outcome of one request, before it is wrapped in a dialect envelope.
#[derive(Debug)]
pub enum ODataResult {
    Collection {
        rows: Vec<Record>,
        count: Option<usize>,
        context: String,
    },
    Entity {
        row: Record,
        context: String,
    },
    /// A single property (or a primitive action result).
    Property {
        name: String,
        value: Value,
        context: String,
    },
    /// `$count` and `$value`: a plain-text body.
    Raw(String),
    Created {
        row: Record,
        context: String,
    },
    NoContent,
}

/// The row a navigation segment started from, needed to create children through it.
struct ParentLink {
    set: Option<Arc<MockEntitySet>>,
    entity_type: Arc<EntityType>,
    row: Record,
    nav: NavigationProperty,
}

struct RowSet {
    entity_type: Arc<EntityType>,
    /// `None` for contained rows and draft administrative data.
    set: Option<Arc<MockEntitySet>>,
    rows: Vec<Record>,
    single: bool,
    keys: KeyMap,
    parent: Option<ParentLink>,
    context: String,
}

enum Resolved {
    Rows(RowSet),
    Count(RowSet),
    Property { name: String, value: Value, context: String },
    RawValue(Value),
}

pub struct DataAccessBuilder {
    schema: Arc<ServiceSchema>,
    store: Arc<EntityStore>,
    settings: MockServerSettings,
    contributors: HashMap<String, Arc<dyn MockDataContributor>>,
    container: Arc<dyn MockDataContributor>,
    metadata: Option<String>,
}

impl DataAccessBuilder {
    /// Override point for one entity set.
    pub fn contributor(mut self, entity_set: impl Into<String>, contributor: Arc<dyn MockDataContributor>) -> Self {
        self.contributors.insert(entity_set.into(), contributor);
        self
    }

    /// Handler for unbound actions and function imports.
    pub fn container_contributor(mut self, contributor: Arc<dyn MockDataContributor>) -> Self {
        self.container = contributor;
        self
    }

    pub fn metadata_document(mut self, document: impl Into<String>) -> Self {
        self.metadata = Some(document.into());
        self
    }

    pub fn build(self) -> DataAccess {
        let DataAccessBuilder {
            schema,
            store,
            settings,
            contributors,
            container,
            metadata,
        } = self;
        for name in contributors.keys() {
            if schema.entity_set(name).is_none() {
                tracing::warn!(entity_set = %name, "contributor registered for unknown entity set");
            }
        }
        let sets = Arc::new_cyclic(|siblings: &Weak<EntitySets>| {
            let sets = schema
                .entity_sets
                .iter()
                .map(|def| {
                    let variant = match (&def.draft, &def.sticky) {
                        (Some(draft), _) => SetVariant::Draft(draft.clone()),
                        (None, Some(sticky)) => {
                            SetVariant::Sticky(StickySessions::new(sticky.clone(), settings.sticky_session_timeout))
                        }
                        (None, None) => SetVariant::Standard,
                    };
                    let contributor = contributors
                        .get(&def.name)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(DefaultContributor) as Arc<dyn MockDataContributor>);
                    let set = MockEntitySet {
                        def: def.clone(),
                        schema: schema.clone(),
                        store: store.clone(),
                        contributor,
                        variant,
                        strict_key_mode: settings.strict_key_mode,
                        siblings: siblings.clone(),
                    };
                    (def.name.clone(), Arc::new(set))
                })
                .collect();
            EntitySets::new(sets)
        });
        let admin_type = schema
            .entity_type(DRAFT_ADMINISTRATIVE_DATA)
            .cloned()
            .unwrap_or_else(draft_admin_type);
        DataAccess {
            schema,
            store,
            sets,
            container,
            strict_key_mode: settings.strict_key_mode,
            service_path: settings.service_path,
            default_user: settings.default_user,
            admin_type,
            metadata,
        }
    }
}

/// One mock service: its schema, entity sets and the executor that serves requests against them.
pub struct DataAccess {
    schema: Arc<ServiceSchema>,
    store: Arc<EntityStore>,
    sets: Arc<EntitySets>,
    container: Arc<dyn MockDataContributor>,
    strict_key_mode: bool,
    service_path: String,
    default_user: String,
    admin_type: Arc<EntityType>,
    metadata: Option<String>,
}

impl DataAccess {
    pub fn builder(schema: Arc<ServiceSchema>, store: Arc<EntityStore>, settings: &MockServerSettings) -> DataAccessBuilder {
        DataAccessBuilder {
            schema,
            store,
            settings: settings.clone(),
            contributors: HashMap::new(),
            container: Arc::new(DefaultContributor),
            metadata: None,
        }
    }

    /// Schema, store and optional `$metadata` document from the configured files.
    pub async fn load(settings: &MockServerSettings, loader: Arc<dyn FileLoader>) -> Result<DataAccessBuilder, AppError> {
        let path = settings
            .service_config
            .as_ref()
            .ok_or_else(|| ConfigError::Settings("ODATA_SERVICE_CONFIG is not set".into()))?;
        let schema = Arc::new(load_schema(loader.as_ref(), path).await?);
        tracing::info!(
            service_path = %settings.service_path,
            entity_sets = schema.entity_sets.len(),
            version = ?schema.version,
            "service schema loaded"
        );
        let store = Arc::new(EntityStore::new(loader.clone(), settings));
        let mut builder = DataAccess::builder(schema, store, settings);
        if let Some(doc) = &settings.metadata_document {
            builder = builder.metadata_document(loader.read_text(doc).await?);
        }
        Ok(builder)
    }

    pub fn schema(&self) -> &Arc<ServiceSchema> {
        &self.schema
    }

    pub fn version(&self) -> ODataVersion {
        self.schema.version
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn metadata_document(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn entity_set(&self, name: &str) -> Option<&Arc<MockEntitySet>> {
        self.sets.get(name)
    }

    pub fn new_context(&self, tenant: impl Into<String>) -> RequestContext {
        RequestContext::new(tenant, self.default_user.clone())
    }

    /// Entity sets and singletons exposed at the service root.
    pub fn service_document(&self) -> Value {
        let names: Vec<&str> = self.schema.entity_sets.iter().map(|s| s.name.as_str()).collect();
        match self.version() {
            ODataVersion::V2 => json!({ "d": { "EntitySets": names } }),
            ODataVersion::V4 => {
                let value: Vec<Value> = self
                    .schema
                    .entity_sets
                    .iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "url": s.name,
                            "kind": if s.singleton { "Singleton" } else { "EntitySet" },
                        })
                    })
                    .collect();
                json!({ "@odata.context": format!("{}/$metadata", self.service_path), "value": value })
            }
        }
    }

    /// Read-only lookup used by other services through the registry.
    pub async fn read_entity_set(&self, tenant: &str, set_name: &str, keys: &KeyMap) -> Result<Vec<Record>, AppError> {
        let set = self
            .sets
            .get(set_name)
            .ok_or_else(|| AppError::NotFound(format!("entity set {}", set_name)))?;
        let mut ctx = self.new_context(tenant);
        set.get(&mut ctx, keys).await
    }

    /// Drop expired sticky sessions of every sticky entity set.
    pub fn sweep_sticky_sessions(&self, now: Instant) -> usize {
        self.sets
            .iter()
            .filter_map(|s| s.sticky_sessions())
            .map(|sessions| sessions.sweep(now))
            .sum()
    }

    pub async fn handle(&self, req: &ODataRequest, ctx: &mut RequestContext) -> Result<ODataResult, AppError> {
        let Some((first, rest)) = req.segments.split_first() else {
            return Err(AppError::BadRequest("empty resource path".into()));
        };
        if rest.is_empty() && self.sets.get(&first.path).is_none() {
            if let Some(action) = self.schema.unbound_action(action_name(&first.path)) {
                return self.run_unbound_action(req, ctx, action, first).await;
            }
        }

        let mut current = Resolved::Rows(self.start(ctx, first).await?);
        for (i, segment) in rest.iter().enumerate() {
            let last = i + 1 == rest.len();
            current = match current {
                Resolved::Rows(target) if last => match self.bound_action(&target, &segment.path) {
                    Some(action) => return self.run_bound_action(req, ctx, target, &segment.path, action).await,
                    None => self.step(ctx, Resolved::Rows(target), segment).await?,
                },
                other => self.step(ctx, other, segment).await?,
            };
        }

        match req.method.as_str() {
            "GET" => self.read(ctx, current, &req.query).await,
            "POST" => self.create(ctx, rows_of(current)?, req).await,
            "PATCH" | "PUT" | "MERGE" => self.update(ctx, rows_of(current)?, req).await,
            "DELETE" => self.delete(ctx, rows_of(current)?).await,
            other => Err(AppError::BadRequest(format!("method {} is not supported", other))),
        }
    }

    // ---- path resolution ----

    async fn start(&self, ctx: &mut RequestContext, segment: &PathSegment) -> Result<RowSet, AppError> {
        let set = self
            .sets
            .get(&segment.path)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("entity set {}", segment.path)))?;
        let entity_type = set.entity_type().clone();
        let context = segment.path.clone();

        if set.def.parametrized {
            if segment.keys.is_empty() {
                return Err(AppError::BadRequest(format!("entity set {} requires parameters", set.name())));
            }
            let params: KeyMap = segment
                .keys
                .iter()
                .filter(|(k, _)| entity_type.property(k).is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let rows = set.get(ctx, &params).await?;
            return Ok(RowSet {
                entity_type,
                set: Some(set),
                rows,
                single: false,
                keys: KeyMap::new(),
                parent: None,
                context,
            });
        }

        let keys = set.normalize_keys(&segment.keys);
        let (mut rows, single): (Vec<Record>, bool) = if set.def.singleton {
            (set.all(ctx).await?.into_iter().take(1).collect(), true)
        } else if keys.is_empty() {
            (set.all(ctx).await?, false)
        } else {
            (set.get(ctx, &keys).await?, true)
        };
        if single && set.is_draft() && !keys.contains_key(IS_ACTIVE_ENTITY) {
            rows.sort_by_key(|r| is_active(r.get(IS_ACTIVE_ENTITY)) != Some(true));
        }
        Ok(RowSet {
            entity_type,
            set: Some(set),
            rows,
            single,
            keys,
            parent: None,
            context,
        })
    }

    async fn step(&self, ctx: &mut RequestContext, current: Resolved, segment: &PathSegment) -> Result<Resolved, AppError> {
        let name = segment.path.as_str();
        match current {
            Resolved::Rows(rows) => self.step_rows(ctx, rows, segment).await,
            Resolved::Property { value, context, .. } => {
                if name == "$value" {
                    return Ok(Resolved::RawValue(value));
                }
                let inner = value
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("property {}", name)))?;
                Ok(Resolved::Property {
                    name: name.to_string(),
                    value: inner,
                    context: format!("{}/{}", context, name),
                })
            }
            Resolved::Count(_) | Resolved::RawValue(_) => {
                Err(AppError::BadRequest(format!("segment {} follows a terminal segment", name)))
            }
        }
    }

    async fn step_rows(&self, ctx: &mut RequestContext, current: RowSet, segment: &PathSegment) -> Result<Resolved, AppError> {
        let name = segment.path.as_str();
        if name == "$count" {
            return Ok(Resolved::Count(current));
        }
        if let Some(set) = &current.set {
            if set.def.parametrized && !current.single && (name == "Set" || name == "Results") {
                return Ok(Resolved::Rows(current));
            }
        }
        if !current.single {
            return Err(AppError::BadRequest(format!("{} cannot follow a collection", name)));
        }
        let row = current
            .rows
            .first()
            .cloned()
            .ok_or_else(|| AppError::NotFound(current.context.clone()))?;

        if name == SIBLING_ENTITY {
            return self.sibling(ctx, current, &row).await.map(Resolved::Rows);
        }
        if name == DRAFT_ADMINISTRATIVE_DATA {
            let rows = match row.get(DRAFT_ADMINISTRATIVE_DATA) {
                Some(Value::Object(admin)) => vec![admin.clone()],
                _ => Vec::new(),
            };
            return Ok(Resolved::Rows(RowSet {
                entity_type: self.admin_type.clone(),
                set: None,
                rows,
                single: true,
                keys: KeyMap::new(),
                parent: None,
                context: DRAFT_ADMINISTRATIVE_DATA.to_string(),
            }));
        }
        if let Some(nav) = current.entity_type.navigation(name).cloned() {
            return self.navigate(ctx, current, row, nav, segment).await.map(Resolved::Rows);
        }
        if current.entity_type.property(name).is_some() || row.contains_key(name) {
            return Ok(Resolved::Property {
                name: name.to_string(),
                value: row.get(name).cloned().unwrap_or(Value::Null),
                context: format!("{}/{}", current.context, name),
            });
        }
        Err(AppError::NotFound(format!("{} on {}", name, current.entity_type.name)))
    }

    /// The other version (active or draft) of the same business keys.
    async fn sibling(&self, ctx: &mut RequestContext, current: RowSet, row: &Record) -> Result<RowSet, AppError> {
        let set = current
            .set
            .ok_or_else(|| AppError::NotFound(format!("{} on {}", SIBLING_ENTITY, current.context)))?;
        let active = is_active(row.get(IS_ACTIVE_ENTITY)).unwrap_or(true);
        let keys = set.version_keys(row, !active);
        let rows = set.fetch_raw(&ctx.tenant, &keys).await?;
        Ok(RowSet {
            entity_type: current.entity_type,
            context: set.name().to_string(),
            set: Some(set),
            rows,
            single: true,
            keys,
            parent: None,
        })
    }

    async fn navigate(
        &self,
        ctx: &mut RequestContext,
        current: RowSet,
        row: Record,
        nav: NavigationProperty,
        segment: &PathSegment,
    ) -> Result<RowSet, AppError> {
        let target_type = self
            .schema
            .entity_type(&nav.target_type)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("entity type {}", nav.target_type)))?;
        let single_target = !nav.is_collection || !segment.keys.is_empty();

        if nav.contains_target {
            let contained = ContainedEntitySet::new(target_type.clone(), row.get(&nav.name));
            let keys = segment.keys.clone();
            let rows = if keys.is_empty() { contained.into_rows() } else { contained.get(&keys) };
            return Ok(RowSet {
                entity_type: target_type,
                set: None,
                rows,
                single: single_target,
                keys,
                context: format!("{}/{}", current.context, nav.name),
                parent: Some(ParentLink {
                    set: current.set,
                    entity_type: current.entity_type,
                    row,
                    nav,
                }),
            });
        }

        let source = current
            .set
            .clone()
            .ok_or_else(|| AppError::NotFound(format!("navigation {} has no entity set", nav.name)))?;
        let target = self.navigation_set(&source, &nav)?;
        let rows = match target_keys(&current.entity_type, &nav, &target_type, &row, self.strict_key_mode) {
            Some((mut keys, _)) => {
                if source.is_draft() && target.is_draft() {
                    carry_active_flag(&mut keys, &row);
                }
                keys.extend(target.normalize_keys(&segment.keys));
                target.get(ctx, &keys).await?
            }
            None => Vec::new(),
        };
        tracing::debug!(navigation = %nav.name, target = %target.name(), rows = rows.len(), "navigation resolved");
        Ok(RowSet {
            entity_type: target_type,
            context: target.name().to_string(),
            keys: target.normalize_keys(&segment.keys),
            set: Some(target),
            rows,
            single: single_target,
            parent: Some(ParentLink {
                set: Some(source),
                entity_type: current.entity_type,
                row,
                nav,
            }),
        })
    }

    fn navigation_set(&self, source: &MockEntitySet, nav: &NavigationProperty) -> Result<Arc<MockEntitySet>, AppError> {
        let def = self
            .schema
            .navigation_target(&source.def, nav)
            .ok_or_else(|| AppError::NotFound(format!("no entity set for navigation {}", nav.name)))?;
        self.sets
            .get(&def.name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("entity set {}", def.name)))
    }

    // ---- actions ----

    /// Action bound to the resolved rows, if `segment` names one. The inner `None` means a lifecycle
    /// action the entity set handles without a schema declaration.
    fn bound_action(&self, target: &RowSet, segment: &str) -> Option<Option<Action>> {
        let set = target.set.as_ref()?;
        if segment.starts_with('$')
            || target.entity_type.navigation(segment).is_some()
            || target.entity_type.property(segment).is_some()
        {
            return None;
        }
        let name = action_name(segment);
        let declared = self
            .schema
            .bound_action(&target.entity_type.name, name, !target.single)
            .cloned();
        if declared.is_none() && !set.handles_action(name) {
            return None;
        }
        Some(declared)
    }

    async fn run_bound_action(
        &self,
        req: &ODataRequest,
        ctx: &mut RequestContext,
        target: RowSet,
        segment: &str,
        action: Option<Action>,
    ) -> Result<ODataResult, AppError> {
        let set = target
            .set
            .ok_or_else(|| AppError::NotFound(format!("action {} has no entity set", segment)))?;
        let keys = if target.single {
            target.rows.first().map(|r| set.keys_of(r)).unwrap_or(target.keys)
        } else {
            KeyMap::new()
        };
        let params = action_params(req, action.as_ref(), &KeyMap::new());
        let name = action_name(segment);
        tracing::debug!(action = %name, entity_set = %set.name(), "bound action");
        let result = set.execute_action(ctx, name, action.as_ref(), &keys, &params).await?;
        Ok(self.action_result(result, Some(&set), name, set.name()))
    }

    async fn run_unbound_action(
        &self,
        req: &ODataRequest,
        ctx: &mut RequestContext,
        action: &Action,
        segment: &PathSegment,
    ) -> Result<ODataResult, AppError> {
        let params = action_params(req, Some(action), &segment.keys);
        let set = action.entity_set.as_deref().and_then(|n| self.sets.get(n)).cloned();
        let result = {
            let cctx = ContributorContext {
                tenant: &ctx.tenant,
                entity_set: set.as_ref().map(|s| s.def.as_ref()),
                schema: &self.schema,
                services: ctx.services.as_deref(),
                store: &self.store,
            };
            self.container.execute_action(action, &KeyMap::new(), &params, &cctx).await
        };
        if let Err(AppError::NotImplemented(_)) = &result {
            tracing::warn!(action = %action.name, "unbound action has no implementation");
        }
        let context = set.as_ref().map(|s| s.name().to_string()).unwrap_or_else(|| action.name.clone());
        Ok(self.action_result(result?, set.as_ref(), &action.name, &context))
    }

    fn action_result(&self, result: Option<Value>, set: Option<&Arc<MockEntitySet>>, name: &str, context: &str) -> ODataResult {
        match result {
            None => ODataResult::NoContent,
            Some(Value::Object(mut row)) => {
                if let Some(set) = set {
                    self.finish_row(&mut row, set.entity_type(), Some(set), &SelectSet::default(), &[]);
                }
                ODataResult::Entity {
                    row,
                    context: context.to_string(),
                }
            }
            Some(Value::Array(items)) => {
                let mut rows: Vec<Record> = items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(o) => Some(o),
                        _ => None,
                    })
                    .collect();
                if let Some(set) = set {
                    for row in rows.iter_mut() {
                        self.finish_row(row, set.entity_type(), Some(set), &SelectSet::default(), &[]);
                    }
                }
                ODataResult::Collection {
                    rows,
                    count: None,
                    context: context.to_string(),
                }
            }
            Some(value) => ODataResult::Property {
                name: name.to_string(),
                value,
                context: context.to_string(),
            },
        }
    }

    // ---- reads ----

    async fn read(&self, ctx: &mut RequestContext, resolved: Resolved, query: &Query) -> Result<ODataResult, AppError> {
        match resolved {
            Resolved::Property { name, value, context } => Ok(ODataResult::Property { name, value, context }),
            Resolved::RawValue(value) => Ok(ODataResult::Raw(raw_text(&value))),
            Resolved::Count(target) => {
                let rows = self.collection_rows(ctx, target, query).await?;
                Ok(ODataResult::Raw(rows.len().to_string()))
            }
            Resolved::Rows(target) if target.single => {
                let RowSet {
                    entity_type,
                    set,
                    rows,
                    context,
                    ..
                } = target;
                let mut rows: Vec<Record> = rows.into_iter().take(1).collect();
                if rows.is_empty() {
                    return Err(AppError::NotFound(context));
                }
                let expand = self.expansion(&entity_type, query);
                if !expand.is_empty() {
                    self.expand_rows(ctx, set.clone(), entity_type.clone(), &mut rows, &expand).await?;
                }
                let mut row = rows.remove(0);
                self.finish_row(&mut row, &entity_type, set.as_ref(), &query.select, &query.expand);
                Ok(ODataResult::Entity { row, context })
            }
            Resolved::Rows(target) => {
                let entity_type = target.entity_type.clone();
                let set = target.set.clone();
                let context = target.context.clone();
                let mut rows = self.collection_rows(ctx, target, query).await?;
                sort_rows(&mut rows, &query.order_by);
                let count = query.count.then_some(rows.len());
                let mut rows: Vec<Record> = rows
                    .into_iter()
                    .skip(query.skip)
                    .take(query.top.unwrap_or(usize::MAX))
                    .collect();
                for row in rows.iter_mut() {
                    self.finish_row(row, &entity_type, set.as_ref(), &query.select, &query.expand);
                }
                Ok(ODataResult::Collection { rows, count, context })
            }
        }
    }

    /// Rows a collection read or `/$count` works on: matches of `$filter` and `$search`, then `$apply`.
    async fn collection_rows(&self, ctx: &mut RequestContext, target: RowSet, query: &Query) -> Result<Vec<Record>, AppError> {
        let entity_type = target.entity_type.clone();
        let set = target.set.clone();
        let rows = self.matching_rows(ctx, target, &entity_type, query).await?;
        if query.apply.is_empty() {
            return Ok(rows);
        }
        let all_rows = match &set {
            Some(s) => s.all(ctx).await?,
            None => rows.clone(),
        };
        Ok(self.run_apply(rows, &all_rows, &entity_type, set.as_ref(), query))
    }

    /// Rows after expansion, `$filter` and `$search`.
    async fn matching_rows(
        &self,
        ctx: &mut RequestContext,
        target: RowSet,
        entity_type: &Arc<EntityType>,
        query: &Query,
    ) -> Result<Vec<Record>, AppError> {
        let RowSet { set, mut rows, .. } = target;
        let expand = self.expansion(entity_type, query);
        if !expand.is_empty() {
            self.expand_rows(ctx, set, entity_type.clone(), &mut rows, &expand).await?;
        }
        let eval = EvalContext::new(&self.schema, entity_type);
        if let Some(filter) = &query.filter {
            rows.retain(|r| evaluate(filter, r, &eval));
        }
        if !query.search.is_empty() {
            rows.retain(|r| matches_search(&query.search, r, entity_type));
        }
        Ok(rows)
    }

    fn run_apply(
        &self,
        rows: Vec<Record>,
        all_rows: &[Record],
        entity_type: &EntityType,
        set: Option<&Arc<MockEntitySet>>,
        query: &Query,
    ) -> Vec<Record> {
        let contributor = set.map(|s| s.contributor().clone());
        let custom = |name: &str, group: &[Record]| -> Option<Value> {
            let contributor = contributor.as_ref()?;
            if contributor.has_custom_aggregate(name) || entity_type.custom_aggregates.contains(name) {
                contributor.perform_custom_aggregate(name, group)
            } else {
                None
            }
        };
        let tctx = TransformContext {
            eval: EvalContext::new(&self.schema, entity_type),
            entity_type,
            all_rows,
            custom: &custom,
        };
        apply_pipeline(rows, &query.apply, &tctx)
    }

    /// Requested expansions plus navigations that `$filter` or `$orderby` read through.
    fn expansion(&self, entity_type: &EntityType, query: &Query) -> Vec<ExpandNode> {
        let mut nodes = query.expand.clone();
        let mut paths = query.filter.as_ref().map(|f| f.referenced_paths()).unwrap_or_default();
        paths.extend(query.order_by.iter().map(|o| o.property.clone()));
        for path in paths {
            let first = path.split('/').next().unwrap_or_default();
            if entity_type.navigation(first).is_some() && !nodes.iter().any(|n| n.name == first) {
                tracing::debug!(navigation = %first, "implicit expand");
                nodes.push(ExpandNode::new(first));
            }
        }
        nodes
    }

    fn expand_rows<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        set: Option<Arc<MockEntitySet>>,
        entity_type: Arc<EntityType>,
        rows: &'a mut [Record],
        nodes: &'a [ExpandNode],
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(async move {
            for node in nodes {
                if node.name == DRAFT_ADMINISTRATIVE_DATA && entity_type.navigation(&node.name).is_none() {
                    continue;
                }
                if node.name == SIBLING_ENTITY {
                    let Some(set) = &set else { continue };
                    for row in rows.iter_mut() {
                        let active = is_active(row.get(IS_ACTIVE_ENTITY)).unwrap_or(true);
                        let keys = set.version_keys(row, !active);
                        let sibling = set.fetch_raw(&ctx.tenant, &keys).await?.into_iter().next();
                        row.insert(SIBLING_ENTITY.to_string(), sibling.map(Value::Object).unwrap_or(Value::Null));
                    }
                    continue;
                }
                let Some(nav) = entity_type.navigation(&node.name).cloned() else {
                    tracing::debug!(navigation = %node.name, entity_type = %entity_type.name, "unknown navigation in $expand");
                    continue;
                };
                let Some(target_type) = self.schema.entity_type(&nav.target_type).cloned() else {
                    continue;
                };

                if nav.contains_target {
                    for row in rows.iter_mut() {
                        if let Some(value) = row.get_mut(&nav.name) {
                            let mut children = ContainedEntitySet::new(target_type.clone(), Some(&*value)).into_rows();
                            for child in children.iter_mut() {
                                prune(child, &target_type, &node.select, &node.expand);
                            }
                            *value = navigation_value(&nav, children);
                        }
                    }
                    continue;
                }

                let Some(source) = &set else { continue };
                let target = match self.navigation_set(source, &nav) {
                    Ok(target) => target,
                    Err(e) => {
                        tracing::debug!(navigation = %nav.name, error = %e, "navigation not expandable");
                        continue;
                    }
                };
                for row in rows.iter_mut() {
                    let mut children = match target_keys(&entity_type, &nav, &target_type, row, self.strict_key_mode) {
                        Some((mut keys, _)) => {
                            if source.is_draft() && target.is_draft() {
                                carry_active_flag(&mut keys, row);
                            }
                            target.get(ctx, &keys).await?
                        }
                        None => Vec::new(),
                    };
                    if !node.expand.is_empty() {
                        self.expand_rows(ctx, Some(target.clone()), target_type.clone(), &mut children, &node.expand)
                            .await?;
                    }
                    for child in children.iter_mut() {
                        prune(child, &target_type, &node.select, &node.expand);
                    }
                    row.insert(nav.name.clone(), navigation_value(&nav, children));
                }
            }
            Ok(())
        })
    }

    /// Projection, then the legacy envelope fields.
    fn finish_row(
        &self,
        row: &mut Record,
        entity_type: &EntityType,
        set: Option<&Arc<MockEntitySet>>,
        select: &SelectSet,
        expand: &[ExpandNode],
    ) {
        prune(row, entity_type, select, expand);
        if self.version() == ODataVersion::V2 {
            let uri = match set {
                Some(s) => format!("{}/{}({})", self.service_path, s.name(), key_predicate(&s.keys_of(row))),
                None => format!("{}/{}", self.service_path, entity_type.name),
            };
            self.decorate_v2(row, entity_type, set.map(|s| s.as_ref()), &uri, select);
        }
    }

    /// `__metadata` blocks, `{results}` wrappers for to-many values and `__deferred` links.
    fn decorate_v2(&self, row: &mut Record, entity_type: &EntityType, set: Option<&MockEntitySet>, uri: &str, select: &SelectSet) {
        for nav in &entity_type.navigation_properties {
            let target_type = self.schema.entity_type(&nav.target_type).cloned();
            let target_set = set.and_then(|s| self.navigation_set(s, nav).ok());
            let child_uri = |child: &Record| match &target_set {
                Some(t) => format!("{}/{}({})", self.service_path, t.name(), key_predicate(&t.keys_of(child))),
                None => format!("{}/{}", uri, nav.name),
            };
            match row.remove(&nav.name) {
                Some(Value::Array(items)) => {
                    let results: Vec<Value> = items
                        .into_iter()
                        .map(|item| match (item, &target_type) {
                            (Value::Object(mut child), Some(t)) => {
                                let child_uri = child_uri(&child);
                                self.decorate_v2(&mut child, t, target_set.as_deref(), &child_uri, &SelectSet::default());
                                Value::Object(child)
                            }
                            (other, _) => other,
                        })
                        .collect();
                    row.insert(nav.name.clone(), json!({ "results": results }));
                }
                Some(Value::Object(mut child)) => {
                    if let Some(t) = &target_type {
                        let child_uri = child_uri(&child);
                        self.decorate_v2(&mut child, t, target_set.as_deref(), &child_uri, &SelectSet::default());
                    }
                    row.insert(nav.name.clone(), Value::Object(child));
                }
                Some(other) => {
                    row.insert(nav.name.clone(), other);
                }
                None if select.includes(&nav.name) => {
                    row.insert(
                        nav.name.clone(),
                        json!({ "__deferred": { "uri": format!("{}/{}", uri, nav.name) } }),
                    );
                }
                None => {}
            }
        }
        let type_name = if self.schema.namespace.is_empty() {
            entity_type.name.clone()
        } else {
            format!("{}.{}", self.schema.namespace, entity_type.name)
        };
        row.insert("__metadata".into(), json!({ "id": uri, "uri": uri, "type": type_name }));
    }

    // ---- writes ----

    async fn create(&self, ctx: &mut RequestContext, target: RowSet, req: &ODataRequest) -> Result<ODataResult, AppError> {
        if target.single {
            return Err(AppError::BadRequest(format!("cannot POST to a single entity ({})", target.context)));
        }
        let mut data = body_record(req)?;
        if let Some(link) = &target.parent {
            if link.nav.contains_target {
                return self.create_contained(ctx, link, &target, data).await;
            }
            data.extend(child_assignments(
                &link.entity_type,
                &link.nav,
                &target.entity_type,
                &link.row,
                self.strict_key_mode,
            ));
            let parent_is_draft = link.set.as_ref().map(|s| s.is_draft()).unwrap_or(false);
            let child_is_draft = target.set.as_ref().map(|s| s.is_draft()).unwrap_or(false);
            if parent_is_draft && child_is_draft {
                if let Some(active) = link.row.get(IS_ACTIVE_ENTITY) {
                    data.insert(IS_ACTIVE_ENTITY.to_string(), active.clone());
                }
                if let Some(admin) = link.row.get(DRAFT_ADMINISTRATIVE_DATA).filter(|a| !a.is_null()) {
                    data.insert(DRAFT_ADMINISTRATIVE_DATA.to_string(), admin.clone());
                }
            }
        }
        let set = target
            .set
            .ok_or_else(|| AppError::BadRequest(format!("{} does not accept new entities", target.context)))?;
        let mut row = set.create(ctx, data).await?;
        if set.is_draft() && is_active(row.get(IS_ACTIVE_ENTITY)) == Some(false) {
            set.touch_draft(ctx, &row).await?;
        }
        self.finish_row(&mut row, &target.entity_type, Some(&set), &SelectSet::default(), &[]);
        Ok(ODataResult::Created {
            row,
            context: set.name().to_string(),
        })
    }

    async fn create_contained(
        &self,
        ctx: &mut RequestContext,
        link: &ParentLink,
        target: &RowSet,
        data: Record,
    ) -> Result<ODataResult, AppError> {
        let parent = link
            .set
            .as_ref()
            .ok_or_else(|| AppError::BadRequest(format!("{} cannot hold new entities", target.context)))?;
        let mut row = empty_row(&target.entity_type.properties, &self.schema);
        row.extend(data);
        let mut items = ContainedEntitySet::new(target.entity_type.clone(), link.row.get(&link.nav.name)).into_rows();
        items.push(row.clone());
        let mut patch = Record::new();
        patch.insert(link.nav.name.clone(), Value::Array(items.into_iter().map(Value::Object).collect()));
        parent.patch_raw(&ctx.tenant, &parent.keys_of(&link.row), &patch).await?;
        Ok(ODataResult::Created {
            row,
            context: target.context.clone(),
        })
    }

    async fn update(&self, ctx: &mut RequestContext, target: RowSet, req: &ODataRequest) -> Result<ODataResult, AppError> {
        let (set, keys) = writable(target)?;
        let patch = body_record(req)?;
        let mut row = set.update(ctx, &keys, patch).await?;
        match self.version() {
            ODataVersion::V2 => Ok(ODataResult::NoContent),
            ODataVersion::V4 => {
                self.finish_row(&mut row, set.entity_type(), Some(&set), &SelectSet::default(), &[]);
                Ok(ODataResult::Entity {
                    row,
                    context: set.name().to_string(),
                })
            }
        }
    }

    async fn delete(&self, ctx: &mut RequestContext, target: RowSet) -> Result<ODataResult, AppError> {
        let (set, keys) = writable(target)?;
        set.delete(ctx, &keys).await?;
        Ok(ODataResult::NoContent)
    }
}

/// Entity set and exact keys of a single resolved entity.
fn writable(target: RowSet) -> Result<(Arc<MockEntitySet>, KeyMap), AppError> {
    if !target.single {
        return Err(AppError::BadRequest(format!("{} is a collection", target.context)));
    }
    let set = target
        .set
        .ok_or_else(|| AppError::BadRequest(format!("{} cannot be modified", target.context)))?;
    let keys = target.rows.first().map(|r| set.keys_of(r)).unwrap_or(target.keys);
    Ok((set, keys))
}

fn rows_of(resolved: Resolved) -> Result<RowSet, AppError> {
    match resolved {
        Resolved::Rows(rows) => Ok(rows),
        _ => Err(AppError::BadRequest("only entities and collections can be modified".into())),
    }
}

fn body_record(req: &ODataRequest) -> Result<Record, AppError> {
    let mut data = match &req.body {
        Some(Value::Object(obj)) => obj.clone(),
        None | Some(Value::Null) => Record::new(),
        Some(_) => return Err(AppError::BadRequest("request body must be a JSON object".into())),
    };
    data.remove("__metadata");
    data.retain(|name, _| !name.starts_with("@odata."));
    Ok(data)
}

/// Action name without namespace qualification.
fn action_name(segment: &str) -> &str {
    segment.rsplit('.').next().unwrap_or(segment)
}

/// Body object, then query string arguments (coerced to declared parameter types), then key-style arguments.
fn action_params(req: &ODataRequest, action: Option<&Action>, segment_keys: &KeyMap) -> Value {
    let mut params = match &req.body {
        Some(Value::Object(obj)) => obj.clone(),
        _ => Record::new(),
    };
    let declared_type = |name: &str| {
        action
            .and_then(|a| a.parameters.iter().find(|p| p.name == name))
            .map(|p| EdmType::parse(short_type_name(&p.type_name)))
    };
    for (name, raw) in &req.query.params {
        if name == SAP_CLIENT_PARAM {
            continue;
        }
        let literal = Value::String(unwrap_literal(raw));
        let value = match declared_type(name) {
            Some(t) => coerce_value(t, &literal),
            None => literal,
        };
        params.entry(name.clone()).or_insert(value);
    }
    for (name, value) in segment_keys {
        let value = match declared_type(name) {
            Some(t) => coerce_value(t, value),
            None => value.clone(),
        };
        params.entry(name.clone()).or_insert(value);
    }
    Value::Object(params)
}

/// Keep selected properties, keys and expanded navigations; drop navigations nobody asked for.
fn prune(row: &mut Record, entity_type: &EntityType, select: &SelectSet, expand: &[ExpandNode]) {
    let expanded: HashSet<&str> = expand.iter().map(|n| n.name.as_str()).collect();
    row.retain(|name, _| {
        if expanded.contains(name.as_str()) {
            return true;
        }
        if name == SIBLING_ENTITY || entity_type.navigation(name).is_some() {
            return false;
        }
        select.includes(name) || entity_type.is_key(name)
    });
}

fn navigation_value(nav: &NavigationProperty, mut children: Vec<Record>) -> Value {
    if nav.is_collection {
        Value::Array(children.into_iter().map(Value::Object).collect())
    } else if children.is_empty() {
        Value::Null
    } else {
        Value::Object(children.swap_remove(0))
    }
}

/// Key predicate in URL form: `('A')`-style for a single key, `k1=..,k2=..` otherwise.
pub fn key_predicate(keys: &KeyMap) -> String {
    let literal = |v: &Value| match v {
        Value::String(s) if looks_like_guid(s) => format!("guid'{}'", s),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    };
    if keys.len() == 1 {
        return keys.values().next().map(literal).unwrap_or_default();
    }
    keys.iter()
        .map(|(k, v)| format!("{}={}", k, literal(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn raw_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn draft_admin_type() -> Arc<EntityType> {
    let property = |name: &str, type_name: &str| Property {
        name: name.to_string(),
        edm_type: EdmType::parse(type_name),
        type_name: type_name.to_string(),
        nullable: true,
        max_length: None,
        precision: None,
        scale: None,
        computed: false,
        is_collection: false,
    };
    Arc::new(EntityType {
        name: DRAFT_ADMINISTRATIVE_DATA.to_string(),
        keys: vec!["DraftUUID".to_string()],
        properties: vec![
            property("DraftUUID", "Edm.Guid"),
            property("CreationDateTime", "Edm.DateTimeOffset"),
            property("CreatedByUser", "Edm.String"),
            property("LastChangeDateTime", "Edm.DateTimeOffset"),
            property("LastChangedByUser", "Edm.String"),
            property("InProcessByUser", "Edm.String"),
            property("DraftIsCreatedByMe", "Edm.Boolean"),
            property("DraftIsProcessedByMe", "Edm.Boolean"),
        ],
        navigation_properties: Vec::new(),
        hierarchies: Vec::new(),
        custom_aggregates: HashSet::new(),
    })
}
