//! Draft lifecycle: edit, activate, prepare and discard over an active row and its inactive shadow.

use crate::config::{DraftRole, ODataVersion};
use crate::error::AppError;
use crate::service::context::RequestContext;
use crate::service::entity_set::MockEntitySet;
use crate::service::navigation::{
    carry_active_flag, is_active, target_keys, DRAFT_ADMINISTRATIVE_DATA, IS_ACTIVE_ENTITY, SIBLING_ENTITY,
};
use crate::store::{format_keys, KeyMap, Record};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

pub const HAS_ACTIVE_ENTITY: &str = "HasActiveEntity";
pub const HAS_DRAFT_ENTITY: &str = "HasDraftEntity";

fn flags(active: bool, has_active: bool, has_draft: bool) -> Record {
    let mut patch = Record::new();
    patch.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(active));
    patch.insert(HAS_ACTIVE_ENTITY.into(), Value::Bool(has_active));
    patch.insert(HAS_DRAFT_ENTITY.into(), Value::Bool(has_draft));
    patch
}

fn draft_uuid(row: &Record) -> Option<String> {
    row.get(DRAFT_ADMINISTRATIVE_DATA)?
        .get("DraftUUID")?
        .as_str()
        .map(str::to_string)
}

impl MockEntitySet {
    /// Timestamp in the dialect's wire form.
    pub(crate) fn now_value(&self) -> Value {
        let now = Utc::now();
        match self.schema.version {
            ODataVersion::V2 => json!(format!("/Date({})/", now.timestamp_millis())),
            ODataVersion::V4 => json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    fn admin_data(&self, ctx: &RequestContext, uuid: &str) -> Value {
        let now = self.now_value();
        json!({
            "DraftUUID": uuid,
            "CreationDateTime": now,
            "CreatedByUser": ctx.user,
            "LastChangeDateTime": now,
            "LastChangedByUser": ctx.user,
            "InProcessByUser": ctx.user,
            "DraftIsCreatedByMe": true,
            "DraftIsProcessedByMe": true,
        })
    }

    /// Flags and administrative data for a row created directly as a draft.
    pub(crate) fn stamp_new_draft(&self, ctx: &RequestContext, row: &mut Record) {
        let explicit = is_active(row.get(IS_ACTIVE_ENTITY));
        if explicit == Some(true) {
            row.insert(HAS_ACTIVE_ENTITY.into(), Value::Bool(false));
            row.insert(HAS_DRAFT_ENTITY.into(), Value::Bool(false));
            return;
        }
        row.extend(flags(false, false, false));
        let admin_missing = row.get(DRAFT_ADMINISTRATIVE_DATA).map(Value::is_null).unwrap_or(true);
        if admin_missing {
            let uuid = uuid::Uuid::new_v4().to_string();
            row.insert(DRAFT_ADMINISTRATIVE_DATA.into(), self.admin_data(ctx, &uuid));
        }
    }

    /// Rows reachable from `root` through navigations into draft node sets, root first.
    pub(crate) async fn draft_tree(
        &self,
        ctx: &RequestContext,
        root: Record,
    ) -> Result<Vec<(Arc<MockEntitySet>, Record)>, AppError> {
        let me = self.sibling(&self.def.name)?;
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut queue = VecDeque::from([(me, root)]);
        let mut out = Vec::new();
        while let Some((set, row)) = queue.pop_front() {
            if !visited.insert((set.def.name.clone(), format_keys(&set.keys_of(&row)))) {
                continue;
            }
            for nav in &set.entity_type().navigation_properties {
                if nav.name == SIBLING_ENTITY || nav.name == DRAFT_ADMINISTRATIVE_DATA || nav.contains_target {
                    continue;
                }
                let Some(target_def) = self.schema.navigation_target(&set.def, nav) else {
                    continue;
                };
                if !matches!(&target_def.draft, Some(d) if d.role == DraftRole::Node) {
                    continue;
                }
                let target = self.sibling(&target_def.name)?;
                let Some((mut keys, _)) =
                    target_keys(set.entity_type(), nav, target.entity_type(), &row, self.strict_key_mode)
                else {
                    continue;
                };
                carry_active_flag(&mut keys, &row);
                for child in target.fetch_raw(&ctx.tenant, &keys).await? {
                    queue.push_back((target.clone(), child));
                }
            }
            out.push((set, row));
        }
        Ok(out)
    }

    /// Refresh the change timestamp on a draft row and on the roots sharing its draft.
    pub(crate) async fn touch_draft(&self, ctx: &RequestContext, row: &Record) -> Result<(), AppError> {
        let Some(uuid) = draft_uuid(row) else {
            return Ok(());
        };
        let now = self.now_value();
        let sets = self
            .siblings
            .upgrade()
            .ok_or_else(|| AppError::Internal("entity set registry dropped".into()))?;
        for set in sets.iter().filter(|s| s.def.name == self.def.name || s.def.is_draft_root()) {
            let mut inactive = KeyMap::new();
            inactive.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(false));
            for candidate in set.fetch_raw(&ctx.tenant, &inactive).await? {
                if draft_uuid(&candidate).as_deref() != Some(uuid.as_str()) {
                    continue;
                }
                let mut admin = candidate.get(DRAFT_ADMINISTRATIVE_DATA).cloned().unwrap_or_else(|| json!({}));
                if let Value::Object(obj) = &mut admin {
                    obj.insert("LastChangeDateTime".into(), now.clone());
                    obj.insert("LastChangedByUser".into(), json!(ctx.user));
                }
                let mut patch = Record::new();
                patch.insert(DRAFT_ADMINISTRATIVE_DATA.into(), admin);
                set.patch_raw(&ctx.tenant, &set.keys_of(&candidate), &patch).await?;
            }
        }
        Ok(())
    }

    /// Active row -> active + draft. Fails when a draft already exists.
    pub(crate) async fn draft_edit(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<Option<Record>, AppError> {
        let mut active_keys = keys.clone();
        active_keys.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(true));
        let active = self
            .fetch_raw(&ctx.tenant, &active_keys)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{}({})", self.def.name, format_keys(&active_keys))))?;
        let draft_keys = self.version_keys(&active, false);
        if !self.fetch_raw(&ctx.tenant, &draft_keys).await?.is_empty() {
            return Err(AppError::Conflict(format!(
                "a draft already exists for {}({})",
                self.def.name,
                format_keys(&draft_keys)
            )));
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        let admin = self.admin_data(ctx, &uuid);
        let mut root_draft = None;
        for (set, row) in self.draft_tree(ctx, active).await? {
            let mut draft = row.clone();
            draft.extend(flags(false, true, false));
            draft.insert(DRAFT_ADMINISTRATIVE_DATA.into(), admin.clone());
            set.insert_raw(&ctx.tenant, draft.clone()).await?;
            let mut patch = Record::new();
            patch.insert(HAS_DRAFT_ENTITY.into(), Value::Bool(true));
            set.patch_raw(&ctx.tenant, &set.keys_of(&row), &patch).await?;
            if root_draft.is_none() {
                root_draft = Some(draft);
            }
        }
        if let (false, Some(row)) = (self.def.is_draft_root(), &root_draft) {
            self.touch_draft(ctx, row).await?;
        }
        tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, draft = %uuid, "draft edit");
        Ok(root_draft)
    }

    /// Draft -> active: copy draft content onto the active rows, drop active children removed in the
    /// draft, then discard the draft.
    pub(crate) async fn draft_activate(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<Option<Record>, AppError> {
        let mut draft_keys = keys.clone();
        draft_keys.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(false));
        let draft = self
            .fetch_raw(&ctx.tenant, &draft_keys)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("no draft for {}({})", self.def.name, format_keys(&draft_keys))))?;
        let draft_tree = self.draft_tree(ctx, draft.clone()).await?;
        let drafted: HashSet<(String, String)> = draft_tree
            .iter()
            .map(|(set, row)| (set.def.name.clone(), format_keys(&set.version_keys(row, true))))
            .collect();

        let active_keys = self.version_keys(&draft, true);
        if let Some(active) = self.fetch_raw(&ctx.tenant, &active_keys).await?.into_iter().next() {
            for (set, row) in self.draft_tree(ctx, active).await?.into_iter().skip(1) {
                let keys = set.version_keys(&row, true);
                if !drafted.contains(&(set.def.name.clone(), format_keys(&keys))) {
                    set.remove_raw(&ctx.tenant, &keys).await?;
                }
            }
        }

        let mut activated_root = None;
        for (set, row) in draft_tree {
            let mut active = row.clone();
            active.extend(flags(true, false, false));
            active.insert(DRAFT_ADMINISTRATIVE_DATA.into(), Value::Null);
            let keys = set.version_keys(&row, true);
            if !set.replace_raw(&ctx.tenant, &keys, active.clone()).await? {
                set.insert_raw(&ctx.tenant, active.clone()).await?;
            }
            set.remove_raw(&ctx.tenant, &set.version_keys(&row, false)).await?;
            if activated_root.is_none() {
                activated_root = Some(active);
            }
        }
        if !self.def.is_draft_root() {
            self.touch_draft(ctx, &draft).await?;
        }
        tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, "draft activated");
        Ok(activated_root)
    }

    /// Read-only: the current draft row.
    pub(crate) async fn draft_prepare(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<Option<Record>, AppError> {
        Ok(self.fetch_raw(&ctx.tenant, keys).await?.into_iter().next())
    }

    /// Delete the inactive row and its draft children; reset `HasDraftEntity` on the active versions.
    /// An active row without a draft is left untouched unless `require_draft` is set.
    pub(crate) async fn draft_discard(&self, ctx: &mut RequestContext, keys: &KeyMap, require_draft: bool) -> Result<(), AppError> {
        let mut draft_keys = keys.clone();
        draft_keys.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(false));
        let Some(draft) = self.fetch_raw(&ctx.tenant, &draft_keys).await?.into_iter().next() else {
            if require_draft {
                return Err(AppError::NotFound(format!("no draft for {}({})", self.def.name, format_keys(&draft_keys))));
            }
            return Ok(());
        };
        for (set, row) in self.draft_tree(ctx, draft.clone()).await? {
            set.remove_raw(&ctx.tenant, &set.keys_of(&row)).await?;
            let mut patch = Record::new();
            patch.insert(HAS_DRAFT_ENTITY.into(), Value::Bool(false));
            set.patch_raw(&ctx.tenant, &set.version_keys(&row, true), &patch).await?;
        }
        if !self.def.is_draft_root() {
            // the removed row still carries the draft id its root is stored under
            self.touch_draft(ctx, &draft).await?;
        }
        tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, "draft discarded");
        Ok(())
    }

    /// DELETE on a draft set: inactive keys discard the draft, active keys remove both versions.
    pub(crate) async fn draft_delete(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Result<(), AppError> {
        match is_active(keys.get(IS_ACTIVE_ENTITY)) {
            Some(false) => self.draft_discard(ctx, keys, true).await,
            _ => {
                let mut active_keys = keys.clone();
                active_keys.insert(IS_ACTIVE_ENTITY.into(), Value::Bool(true));
                let Some(active) = self.fetch_raw(&ctx.tenant, &active_keys).await?.into_iter().next() else {
                    return Err(AppError::NotFound(format!("{}({})", self.def.name, format_keys(&active_keys))));
                };
                self.draft_discard(ctx, keys, false).await?;
                for (set, row) in self.draft_tree(ctx, active).await? {
                    set.remove_raw(&ctx.tenant, &set.keys_of(&row)).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, MockServerSettings, ServiceConfig};
    use crate::files::MemoryFileLoader;
    use crate::service::{DataAccess, RequestContext};
    use crate::store::EntityStore;

    fn access() -> DataAccess {
        let config: ServiceConfig = serde_json::from_value(json!({
            "version": "4.0",
            "entity_types": [
                {
                    "name": "Form",
                    "keys": ["ID", "IsActiveEntity"],
                    "properties": [
                        { "name": "ID", "type": "Edm.Int32" },
                        { "name": "IsActiveEntity", "type": "Edm.Boolean" },
                        { "name": "FirstName", "type": "Edm.String" }
                    ],
                    "navigation_properties": [
                        { "name": "_Lines", "target_type": "Line", "is_collection": true,
                          "referential_constraints": [{ "property": "ID", "referenced_property": "FormID" }] }
                    ]
                },
                {
                    "name": "Line",
                    "keys": ["FormID", "LineNo", "IsActiveEntity"],
                    "properties": [
                        { "name": "FormID", "type": "Edm.Int32" },
                        { "name": "LineNo", "type": "Edm.Int32" },
                        { "name": "IsActiveEntity", "type": "Edm.Boolean" },
                        { "name": "Text", "type": "Edm.String" }
                    ]
                }
            ],
            "entity_sets": [
                { "name": "Forms", "entity_type": "Form", "draft": { "root": true } },
                { "name": "Lines", "entity_type": "Line", "draft": { "node": true } }
            ]
        }))
        .unwrap();
        let loader = MemoryFileLoader::new()
            .with_file("/data/Forms.json", r#"[{"ID":1,"FirstName":"Ann"}]"#)
            .with_file("/data/Lines.json", r#"[{"FormID":1,"LineNo":1,"Text":"a"},{"FormID":1,"LineNo":2,"Text":"b"}]"#);
        let settings = MockServerSettings {
            mock_data_dir: Some("/data".into()),
            ..Default::default()
        };
        let schema = Arc::new(resolve(&config).unwrap());
        let store = Arc::new(EntityStore::new(Arc::new(loader), &settings));
        DataAccess::builder(schema, store, &settings).build()
    }

    fn keys(id: i64, active: bool) -> KeyMap {
        [("ID".to_string(), json!(id)), (IS_ACTIVE_ENTITY.to_string(), json!(active))].into()
    }

    #[tokio::test]
    async fn edit_then_activate_round_trip() {
        let data = access();
        let forms = data.entity_set("Forms").unwrap().clone();
        let lines = data.entity_set("Lines").unwrap().clone();
        let mut ctx = RequestContext::new("t", "alice");

        let draft = forms.draft_edit(&mut ctx, &keys(1, true)).await.unwrap().unwrap();
        assert_eq!(draft[IS_ACTIVE_ENTITY], json!(false));
        assert_eq!(draft[HAS_ACTIVE_ENTITY], json!(true));
        assert_eq!(draft[DRAFT_ADMINISTRATIVE_DATA]["InProcessByUser"], json!("alice"));
        assert_eq!(forms.fetch_raw("t", &[("ID".to_string(), json!(1))].into()).await.unwrap().len(), 2);
        assert_eq!(lines.all_raw("t").await.unwrap().len(), 4);
        assert!(forms.draft_edit(&mut ctx, &keys(1, true)).await.is_err());

        let mut patch = Record::new();
        patch.insert("FirstName".into(), json!("Bob"));
        forms.update(&mut ctx, &keys(1, false), patch).await.unwrap();
        let mut line_keys = KeyMap::new();
        line_keys.insert("FormID".into(), json!(1));
        line_keys.insert("LineNo".into(), json!(2));
        line_keys.insert(IS_ACTIVE_ENTITY.into(), json!(false));
        lines.remove_raw("t", &line_keys).await.unwrap();

        let active = forms.draft_activate(&mut ctx, &keys(1, false)).await.unwrap().unwrap();
        assert_eq!(active["FirstName"], json!("Bob"));
        assert_eq!(active[DRAFT_ADMINISTRATIVE_DATA], Value::Null);
        let rows = forms.all_raw("t").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][IS_ACTIVE_ENTITY], json!(true));
        assert_eq!(rows[0][HAS_DRAFT_ENTITY], json!(false));
        let remaining = lines.all_raw("t").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["LineNo"], json!(1));
    }

    #[tokio::test]
    async fn discard_without_draft_keeps_rows() {
        let data = access();
        let forms = data.entity_set("Forms").unwrap().clone();
        let mut ctx = RequestContext::new("t", "alice");
        forms.draft_discard(&mut ctx, &keys(1, true), false).await.unwrap();
        assert_eq!(forms.all_raw("t").await.unwrap().len(), 1);

        forms.draft_edit(&mut ctx, &keys(1, true)).await.unwrap();
        forms.delete(&mut ctx, &keys(1, false)).await.unwrap();
        let rows = forms.all_raw("t").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][HAS_DRAFT_ENTITY], json!(false));
        assert!(forms.delete(&mut ctx, &keys(1, false)).await.is_err());
    }

    #[tokio::test]
    async fn node_discard_refreshes_root_change_time() {
        let data = access();
        let forms = data.entity_set("Forms").unwrap().clone();
        let lines = data.entity_set("Lines").unwrap().clone();
        let mut ctx = RequestContext::new("t", "alice");
        forms.draft_edit(&mut ctx, &keys(1, true)).await.unwrap();
        let changed_at = |rows: Vec<Record>| rows[0][DRAFT_ADMINISTRATIVE_DATA]["LastChangeDateTime"].clone();
        let before = changed_at(forms.fetch_raw("t", &keys(1, false)).await.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut line_keys = KeyMap::new();
        line_keys.insert("FormID".into(), json!(1));
        line_keys.insert("LineNo".into(), json!(2));
        line_keys.insert(IS_ACTIVE_ENTITY.into(), json!(false));
        let mut bob = RequestContext::new("t", "bob");
        lines.delete(&mut bob, &line_keys).await.unwrap();

        let root = forms.fetch_raw("t", &keys(1, false)).await.unwrap();
        assert_ne!(changed_at(root.clone()), before);
        assert_eq!(root[0][DRAFT_ADMINISTRATIVE_DATA]["LastChangedByUser"], json!("bob"));
        assert_eq!(lines.all_raw("t").await.unwrap().len(), 3);
    }
}
