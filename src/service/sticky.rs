//! Sticky sessions: one transient, unsaved working copy per tenant, held between an open action
//! (new/edit) and save or discard. Sessions expire after a rolling timeout; expired ones are
//! dropped on access and by the periodic sweeper.

use crate::config::StickySettings;
use crate::error::AppError;
use crate::query::CONTEXT_ID_HEADER;
use crate::service::context::RequestContext;
use crate::service::entity_set::{coerce_value, MockEntitySet};
use crate::store::{empty_row, format_keys, generate_key, row_matches, KeyMap, Record};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const SESSION_TIMEOUT_HEADER: &str = "sap-http-session-timeout";
/// Marks a row that only exists inside an open session.
pub const TRANSIENT_FLAG: &str = "__transient";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StickyAction {
    New,
    Edit,
    Save,
    Discard,
}

#[derive(Clone, Debug)]
struct StickySession {
    context_id: String,
    row: Record,
    expires_at: Instant,
}

pub struct StickySessions {
    settings: StickySettings,
    timeout: Duration,
    sessions: Mutex<HashMap<String, StickySession>>,
}

impl StickySessions {
    pub fn new(settings: StickySettings, timeout: Duration) -> Self {
        StickySessions {
            settings,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StickySession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn action(&self, name: &str) -> Option<StickyAction> {
        let s = &self.settings;
        let is = |candidate: &Option<String>| candidate.as_deref() == Some(name);
        if is(&s.new_action) {
            Some(StickyAction::New)
        } else if is(&s.edit_action) {
            Some(StickyAction::Edit)
        } else if is(&s.save_action) {
            Some(StickyAction::Save)
        } else if is(&s.discard_action) {
            Some(StickyAction::Discard)
        } else {
            None
        }
    }

    pub fn handles(&self, name: &str) -> bool {
        self.action(name).is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start (or restart) the tenant's session with `row`. Returns the session token.
    fn open(&self, tenant: &str, row: Record) -> String {
        let context_id = format!("SID:ANON:{}", uuid::Uuid::new_v4().simple());
        self.lock().insert(
            tenant.to_string(),
            StickySession {
                context_id: context_id.clone(),
                row,
                expires_at: Instant::now() + self.timeout,
            },
        );
        context_id
    }

    /// Live session of the tenant with its expiry pushed out. Expired sessions are dropped.
    fn current(&self, tenant: &str) -> Option<(String, Record)> {
        let mut sessions = self.lock();
        let now = Instant::now();
        match sessions.get_mut(tenant) {
            Some(s) if s.expires_at > now => {
                s.expires_at = now + self.timeout;
                Some((s.context_id.clone(), s.row.clone()))
            }
            Some(_) => {
                sessions.remove(tenant);
                tracing::debug!(tenant = %tenant, "sticky session expired");
                None
            }
            None => None,
        }
    }

    fn set_row(&self, tenant: &str, row: Record) {
        if let Some(s) = self.lock().get_mut(tenant) {
            s.row = row;
            s.expires_at = Instant::now() + self.timeout;
        }
    }

    fn close(&self, tenant: &str) -> Option<Record> {
        self.lock().remove(tenant).map(|s| s.row)
    }

    pub fn is_open(&self, tenant: &str) -> bool {
        self.lock().get(tenant).map(|s| s.expires_at > Instant::now()).unwrap_or(false)
    }

    /// Drop every session that expired before `now`. Returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }
}

impl MockEntitySet {
    fn announce_session(&self, ctx: &mut RequestContext, context_id: &str, timeout: Duration) {
        ctx.set_header(CONTEXT_ID_HEADER, context_id);
        ctx.set_header(SESSION_TIMEOUT_HEADER, timeout.as_secs().to_string());
    }

    /// The transient row when an open session holds one matching `keys`.
    pub(crate) fn sticky_read(&self, ctx: &mut RequestContext, keys: &KeyMap) -> Option<Record> {
        let sessions = self.sticky_sessions()?;
        if keys.is_empty() {
            return None;
        }
        let (context_id, row) = sessions.current(&ctx.tenant)?;
        if !row_matches(&row, keys) {
            return None;
        }
        self.announce_session(ctx, &context_id, sessions.timeout());
        Some(row)
    }

    /// Merge `patch` into the transient row when it matches `keys`.
    pub(crate) fn sticky_update(&self, ctx: &mut RequestContext, keys: &KeyMap, patch: &Record) -> Option<Record> {
        let sessions = self.sticky_sessions()?;
        let (context_id, mut row) = sessions.current(&ctx.tenant)?;
        if !row_matches(&row, keys) {
            return None;
        }
        row.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        sessions.set_row(&ctx.tenant, row.clone());
        self.announce_session(ctx, &context_id, sessions.timeout());
        Some(row)
    }

    /// Close the session when its transient row matches `keys`.
    pub(crate) fn sticky_discard_matching(&self, ctx: &mut RequestContext, keys: &KeyMap) -> bool {
        let Some(sessions) = self.sticky_sessions() else {
            return false;
        };
        match sessions.current(&ctx.tenant) {
            Some((_, row)) if row_matches(&row, keys) => {
                sessions.close(&ctx.tenant);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn sticky_action(
        &self,
        ctx: &mut RequestContext,
        name: &str,
        keys: &KeyMap,
        params: &Value,
    ) -> Result<Option<Record>, AppError> {
        let sessions = self
            .sticky_sessions()
            .ok_or_else(|| AppError::Internal(format!("{} is not sticky", self.def.name)))?;
        let action = sessions
            .action(name)
            .ok_or_else(|| AppError::NotFound(format!("action {} on {}", name, self.def.name)))?;
        match action {
            StickyAction::New => {
                let entity_type = self.entity_type().clone();
                let mut row = empty_row(&entity_type.properties, &self.schema);
                if let Value::Object(params) = params {
                    for (name, value) in params {
                        if let Some(p) = entity_type.property(name) {
                            row.insert(name.clone(), coerce_value(p.edm_type, value));
                        }
                    }
                }
                let generated = self
                    .store
                    .read(&ctx.tenant, &self.def, &self.schema, |c| {
                        entity_type
                            .keys
                            .iter()
                            .filter(|k| row.get(*k).map(Value::is_null).unwrap_or(true))
                            .filter_map(|k| entity_type.property(k).map(|p| (k.clone(), generate_key(p, c))))
                            .collect::<Vec<_>>()
                    })
                    .await?;
                row.extend(generated);
                row.insert(TRANSIENT_FLAG.into(), Value::Bool(true));
                let context_id = sessions.open(&ctx.tenant, row.clone());
                self.announce_session(ctx, &context_id, sessions.timeout());
                tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, "sticky session opened for new entity");
                Ok(Some(row))
            }
            StickyAction::Edit => {
                let row = self
                    .fetch_raw(&ctx.tenant, keys)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::NotFound(format!("{}({})", self.def.name, format_keys(keys))))?;
                let context_id = sessions.open(&ctx.tenant, row.clone());
                self.announce_session(ctx, &context_id, sessions.timeout());
                tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, keys = %format_keys(keys), "sticky session opened for edit");
                Ok(Some(row))
            }
            StickyAction::Save => {
                if sessions.current(&ctx.tenant).is_none() {
                    return Err(AppError::BadRequest(format!("no open sticky session on {}", self.def.name)));
                }
                let mut row = sessions
                    .close(&ctx.tenant)
                    .ok_or_else(|| AppError::BadRequest(format!("no open sticky session on {}", self.def.name)))?;
                row.remove(TRANSIENT_FLAG);
                let row_keys = self.keys_of(&row);
                if self.patch_raw(&ctx.tenant, &row_keys, &row).await?.is_none() {
                    self.insert_raw(&ctx.tenant, row.clone()).await?;
                }
                tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, keys = %format_keys(&row_keys), "sticky session saved");
                Ok(Some(row))
            }
            StickyAction::Discard => {
                sessions.close(&ctx.tenant);
                tracing::info!(entity_set = %self.def.name, tenant = %ctx.tenant, "sticky session discarded");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, MockServerSettings, ServiceConfig};
    use crate::files::MemoryFileLoader;
    use crate::service::DataAccess;
    use crate::store::EntityStore;
    use serde_json::json;
    use std::sync::Arc;

    fn access(timeout: Duration) -> DataAccess {
        let config: ServiceConfig = serde_json::from_value(json!({
            "version": "4.0",
            "entity_types": [{
                "name": "Cart",
                "keys": ["CartID"],
                "properties": [
                    { "name": "CartID", "type": "Edm.Int32" },
                    { "name": "Owner", "type": "Edm.String" }
                ]
            }],
            "entity_sets": [{
                "name": "Carts",
                "entity_type": "Cart",
                "sticky": { "new_action": "NewAction", "edit_action": "EditAction",
                            "save_action": "SaveChanges", "discard_action": "DiscardAction" }
            }]
        }))
        .unwrap();
        let settings = MockServerSettings {
            generate_mock_data: false,
            sticky_session_timeout: timeout,
            ..Default::default()
        };
        let schema = Arc::new(resolve(&config).unwrap());
        let store = Arc::new(EntityStore::new(Arc::new(MemoryFileLoader::new()), &settings));
        DataAccess::builder(schema, store, &settings).build()
    }

    #[tokio::test]
    async fn new_then_save_persists_and_closes() {
        let data = access(Duration::from_secs(60));
        let carts = data.entity_set("Carts").unwrap().clone();
        let mut ctx = RequestContext::new("t", "u");

        let row = carts
            .sticky_action(&mut ctx, "NewAction", &KeyMap::new(), &json!({ "Owner": "ann" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row[TRANSIENT_FLAG], json!(true));
        assert_eq!(row["CartID"], json!(1));
        assert!(ctx.header(CONTEXT_ID_HEADER).unwrap().starts_with("SID:ANON:"));
        assert_eq!(ctx.header(SESSION_TIMEOUT_HEADER), Some("60"));
        assert!(carts.all_raw("t").await.unwrap().is_empty());

        let keys: KeyMap = [("CartID".to_string(), json!(1))].into();
        let mut patch = Record::new();
        patch.insert("Owner".into(), json!("bob"));
        carts.update(&mut ctx, &keys, patch).await.unwrap();
        assert_eq!(carts.get(&mut ctx, &keys).await.unwrap()[0]["Owner"], json!("bob"));

        carts.sticky_action(&mut ctx, "SaveChanges", &KeyMap::new(), &Value::Null).await.unwrap();
        let stored = carts.all_raw("t").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["Owner"], json!("bob"));
        assert!(stored[0].get(TRANSIENT_FLAG).is_none());
        assert!(!carts.sticky_sessions().unwrap().is_open("t"));
        assert!(carts
            .sticky_action(&mut ctx, "SaveChanges", &KeyMap::new(), &Value::Null)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let data = access(Duration::from_millis(0));
        let carts = data.entity_set("Carts").unwrap().clone();
        let mut ctx = RequestContext::new("t", "u");
        carts.sticky_action(&mut ctx, "NewAction", &KeyMap::new(), &Value::Null).await.unwrap();
        let keys: KeyMap = [("CartID".to_string(), json!(1))].into();
        assert!(carts.sticky_read(&mut ctx, &keys).is_none());

        carts.sticky_action(&mut ctx, "NewAction", &KeyMap::new(), &Value::Null).await.unwrap();
        let swept = carts.sticky_sessions().unwrap().sweep(Instant::now() + Duration::from_secs(1));
        assert_eq!(swept, 1);
    }
}
