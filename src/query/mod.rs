//! Query Parser: turns method, path, query string, headers and body into an [`ODataRequest`].

mod apply;
mod filter;
mod parser;

pub use apply::{parse_apply, AggregateExpr, AggregateMethod, HierarchyStep, TopLevels, Transformation};
pub use filter::{parse_filter, CompareOp, FilterExpr, Lambda, LambdaKind, Literal, Operand};
pub use parser::{
    decode, is_balanced, parse_expand, parse_key_predicate, parse_order_by, parse_path, parse_query, parse_search,
    parse_select, split_call, split_top_level,
};

use crate::error::AppError;
use crate::store::KeyMap;
use axum::http::{HeaderMap, Method};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Header sent back and forth to keep a sticky session alive.
pub const CONTEXT_ID_HEADER: &str = "sap-contextid";

/// One `/`-separated resource path segment with its key predicate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathSegment {
    pub path: String,
    pub keys: KeyMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub property: String,
    pub direction: SortDirection,
}

/// Selected properties; `all` means `*` (the default).
#[derive(Clone, Debug, PartialEq)]
pub struct SelectSet {
    pub all: bool,
    pub properties: BTreeSet<String>,
}

impl Default for SelectSet {
    fn default() -> Self {
        SelectSet {
            all: true,
            properties: BTreeSet::new(),
        }
    }
}

impl SelectSet {
    pub fn includes(&self, name: &str) -> bool {
        self.all || self.properties.contains(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExpandNode {
    pub name: String,
    pub select: SelectSet,
    pub expand: Vec<ExpandNode>,
}

impl ExpandNode {
    pub fn new(name: impl Into<String>) -> Self {
        ExpandNode {
            name: name.into(),
            select: SelectSet::default(),
            expand: Vec::new(),
        }
    }
}

/// Parsed system query options.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub filter: Option<FilterExpr>,
    pub search: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub select: SelectSet,
    pub expand: Vec<ExpandNode>,
    pub apply: Vec<Transformation>,
    pub skip: usize,
    /// `None` is unbounded.
    pub top: Option<usize>,
    pub count: bool,
    /// Non-system parameters (function import arguments, `sap-client`).
    pub params: BTreeMap<String, String>,
}

/// A fully parsed incoming request.
#[derive(Clone, Debug)]
pub struct ODataRequest {
    pub method: Method,
    pub segments: Vec<PathSegment>,
    pub query: Query,
    pub tenant: String,
    /// `Prefer: return=minimal`.
    pub prefer_minimal: bool,
    pub context_id: Option<String>,
    pub body: Option<Value>,
}

impl ODataRequest {
    /// `path` is relative to the service root.
    pub fn parse(
        method: Method,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        tenant: String,
        body: Option<Value>,
    ) -> Result<Self, AppError> {
        let segments = parse_path(path)?;
        let query = parse_query(raw_query)?;
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        let prefer_minimal = header("prefer")
            .map(|p| p.split(',').any(|part| part.trim().eq_ignore_ascii_case("return=minimal")))
            .unwrap_or(false);
        Ok(ODataRequest {
            method,
            segments,
            query,
            tenant,
            prefer_minimal,
            context_id: header(CONTEXT_ID_HEADER),
            body,
        })
    }

    /// Last path segment name, e.g. an action name or `$count`.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reads_prefer_and_context_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "odata.continue-on-error, return=minimal".parse().unwrap());
        headers.insert(CONTEXT_ID_HEADER, "SID:ANON:abc".parse().unwrap());
        let request = ODataRequest::parse(
            Method::PATCH,
            "/Orders(1)",
            Some("$select=ID"),
            &headers,
            "tenant-default".into(),
            None,
        )
        .unwrap();
        assert!(request.prefer_minimal);
        assert_eq!(request.context_id.as_deref(), Some("SID:ANON:abc"));
        assert_eq!(request.last_segment(), Some("Orders"));
        assert!(!request.query.select.all);
    }
}
