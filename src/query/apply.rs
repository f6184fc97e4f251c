//! `$apply` pipeline: ordered transformations separated by `/`.
//!
//! Unrecognized transformations are skipped with a warning; malformed filters inside a known
//! transformation are client errors.

use crate::error::AppError;
use crate::query::filter::{parse_filter, FilterExpr};
use crate::query::parser::{parse_order_by, parse_search, split_call, split_top_level};
use crate::query::OrderBy;
use crate::store::unwrap_literal;
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateMethod {
    Sum,
    Max,
    Min,
    Average,
    CountDistinct,
    /// `$count as Alias`: number of rows in the group.
    Count,
}

impl AggregateMethod {
    fn parse(word: &str) -> Option<AggregateMethod> {
        match word.to_ascii_lowercase().as_str() {
            "sum" => Some(AggregateMethod::Sum),
            "max" => Some(AggregateMethod::Max),
            "min" => Some(AggregateMethod::Min),
            "average" | "avg" => Some(AggregateMethod::Average),
            "countdistinct" => Some(AggregateMethod::CountDistinct),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateExpr {
    pub property: String,
    /// `None` when no `with` clause was given: a custom aggregate if the type declares one, else sum.
    pub method: Option<AggregateMethod>,
    pub alias: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HierarchyStep {
    /// `$root/<EntitySet>` reference naming the hierarchy's node collection.
    pub hierarchy_root: String,
    pub qualifier: String,
    pub node_property: String,
    /// Transformations selecting the start nodes.
    pub input: Vec<Transformation>,
    pub max_distance: Option<usize>,
    pub keep_start: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopLevels {
    pub hierarchy_root: String,
    pub qualifier: String,
    pub node_property: String,
    /// `None` shows every level.
    pub levels: Option<usize>,
    /// Node id -> levels to expand below it (`Some(0)` collapses, `None` expands fully).
    pub expand_levels: Vec<(String, Option<usize>)>,
    pub show: Vec<String>,
    /// Node id the output window starts at.
    pub skip_location: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transformation {
    Filter(FilterExpr),
    Search(Vec<String>),
    GroupBy {
        properties: Vec<String>,
        aggregates: Vec<AggregateExpr>,
        /// Transformations applied to each group before aggregation.
        nested: Vec<Transformation>,
    },
    Aggregate(Vec<AggregateExpr>),
    OrderBy(Vec<OrderBy>),
    Top(usize),
    Skip(usize),
    Concat(Vec<Vec<Transformation>>),
    Ancestors(HierarchyStep),
    Descendants(HierarchyStep),
    TopLevels(TopLevels),
}

/// Parse a decoded `$apply` value.
pub fn parse_apply(input: &str) -> Result<Vec<Transformation>, AppError> {
    let mut pipeline = Vec::new();
    for step in split_top_level(input, '/') {
        match parse_step(&step)? {
            Some(t) => pipeline.push(t),
            None => tracing::warn!(transformation = %step, "unrecognized $apply transformation ignored"),
        }
    }
    Ok(pipeline)
}

fn parse_step(step: &str) -> Result<Option<Transformation>, AppError> {
    let Some((name, args)) = split_call(step) else {
        return Ok(None);
    };
    let transformation = match name {
        "filter" => Transformation::Filter(parse_filter(args)?),
        "search" => Transformation::Search(parse_search(args)),
        "orderby" => Transformation::OrderBy(parse_order_by(args)),
        "top" => match args.trim().parse() {
            Ok(n) => Transformation::Top(n),
            Err(_) => return Ok(None),
        },
        "skip" => match args.trim().parse() {
            Ok(n) => Transformation::Skip(n),
            Err(_) => return Ok(None),
        },
        "aggregate" => Transformation::Aggregate(parse_aggregates(args)),
        "groupby" => return parse_group_by(args),
        "concat" => {
            let mut branches = Vec::new();
            for branch in split_top_level(args, ',') {
                branches.push(parse_apply(&branch)?);
            }
            Transformation::Concat(branches)
        }
        "ancestors" => match parse_hierarchy_step(args)? {
            Some(h) => Transformation::Ancestors(h),
            None => return Ok(None),
        },
        "descendants" => match parse_hierarchy_step(args)? {
            Some(h) => Transformation::Descendants(h),
            None => return Ok(None),
        },
        other if other.rsplit('.').next() == Some("TopLevels") => match parse_top_levels(args) {
            Some(t) => Transformation::TopLevels(t),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(transformation))
}

/// `(A,B),aggregate(X with sum as Y)` or `(A,B)` alone.
fn parse_group_by(args: &str) -> Result<Option<Transformation>, AppError> {
    let parts = split_top_level(args, ',');
    let Some(group) = parts.first() else {
        return Ok(None);
    };
    let Some(inner) = group.strip_prefix('(').and_then(|g| g.strip_suffix(')')) else {
        return Ok(None);
    };
    let properties = split_top_level(inner, ',');
    let mut aggregates = Vec::new();
    let mut nested = Vec::new();
    for rest in &parts[1..] {
        for step in split_top_level(rest, '/') {
            match split_call(&step) {
                Some(("aggregate", a)) => aggregates.extend(parse_aggregates(a)),
                _ => match parse_step(&step)? {
                    Some(t) => nested.push(t),
                    None => tracing::warn!(transformation = %step, "unrecognized groupby step ignored"),
                },
            }
        }
    }
    Ok(Some(Transformation::GroupBy {
        properties,
        aggregates,
        nested,
    }))
}

fn parse_aggregates(args: &str) -> Vec<AggregateExpr> {
    split_top_level(args, ',')
        .iter()
        .filter_map(|item| parse_aggregate(item))
        .collect()
}

fn parse_aggregate(item: &str) -> Option<AggregateExpr> {
    let words: Vec<&str> = item.split_whitespace().collect();
    let property = (*words.first()?).to_string();
    let mut method = None;
    let mut alias = property.clone();
    let mut i = 1;
    while i + 1 < words.len() {
        match words[i] {
            "with" => method = AggregateMethod::parse(words[i + 1]),
            "as" => alias = words[i + 1].to_string(),
            _ => {}
        }
        i += 2;
    }
    if property == "$count" {
        method = Some(AggregateMethod::Count);
    }
    Some(AggregateExpr {
        property,
        method,
        alias,
    })
}

/// `$root/Set,Qualifier,NodeProperty,<transformations>[,<max distance>][,keep start]`
fn parse_hierarchy_step(args: &str) -> Result<Option<HierarchyStep>, AppError> {
    let parts = split_top_level(args, ',');
    if parts.len() < 4 {
        return Ok(None);
    }
    let mut step = HierarchyStep {
        hierarchy_root: parts[0].clone(),
        qualifier: unwrap_literal(&parts[1]),
        node_property: unwrap_literal(&parts[2]),
        input: parse_apply(&parts[3])?,
        max_distance: None,
        keep_start: false,
    };
    for extra in &parts[4..] {
        if extra.eq_ignore_ascii_case("keep start") {
            step.keep_start = true;
        } else if let Ok(n) = extra.parse() {
            step.max_distance = Some(n);
        }
    }
    Ok(Some(step))
}

#[derive(Deserialize)]
struct ExpandLevel {
    #[serde(rename = "NodeID")]
    node_id: serde_json::Value,
    #[serde(rename = "Levels")]
    levels: Option<usize>,
}

/// Named parameters: `HierarchyNodes=..., HierarchyQualifier='..', NodeProperty='..', Levels=n,
/// ExpandLevels=[{"NodeID":..,"Levels":..}], Show=[..], SkipLocation='..'`.
fn parse_top_levels(args: &str) -> Option<TopLevels> {
    let mut top = TopLevels {
        hierarchy_root: String::new(),
        qualifier: String::new(),
        node_property: String::new(),
        levels: None,
        expand_levels: Vec::new(),
        show: Vec::new(),
        skip_location: None,
    };
    for arg in split_top_level(args, ',') {
        let (name, value) = arg.split_once('=')?;
        let value = value.trim();
        match name.trim() {
            "HierarchyNodes" => top.hierarchy_root = value.to_string(),
            "HierarchyQualifier" => top.qualifier = unwrap_literal(value),
            "NodeProperty" => top.node_property = unwrap_literal(value),
            "Levels" => top.levels = value.parse().ok(),
            "ExpandLevels" => match serde_json::from_str::<Vec<ExpandLevel>>(value) {
                Ok(levels) => {
                    top.expand_levels = levels
                        .into_iter()
                        .map(|l| (json_id(&l.node_id), l.levels))
                        .collect()
                }
                Err(e) => tracing::warn!(error = %e, "invalid ExpandLevels ignored"),
            },
            "Show" => top.show = parse_id_list(value),
            "SkipLocation" => top.skip_location = Some(unwrap_literal(value)).filter(|id| !id.is_empty()),
            other => tracing::debug!(parameter = %other, "TopLevels parameter ignored"),
        }
    }
    if top.qualifier.is_empty() || top.node_property.is_empty() {
        return None;
    }
    Some(top)
}

fn json_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_id_list(value: &str) -> Vec<String> {
    if let Ok(ids) = serde_json::from_str::<Vec<serde_json::Value>>(value) {
        return ids.iter().map(json_id).collect();
    }
    let inner = value.trim_start_matches('[').trim_end_matches(']');
    split_top_level(inner, ',').iter().map(|s| unwrap_literal(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groupby_with_default_and_explicit_methods() {
        let p = parse_apply("groupby((Customer),aggregate(CreditScore,Amount with max as MaxAmount,$count as N))").unwrap();
        let Transformation::GroupBy { properties, aggregates, .. } = &p[0] else { panic!() };
        assert_eq!(properties, &vec!["Customer".to_string()]);
        assert_eq!(aggregates[0].method, None);
        assert_eq!(aggregates[0].alias, "CreditScore");
        assert_eq!(aggregates[1].method, Some(AggregateMethod::Max));
        assert_eq!(aggregates[1].alias, "MaxAmount");
        assert_eq!(aggregates[2].method, Some(AggregateMethod::Count));
    }

    #[test]
    fn pipeline_steps_in_order() {
        let p = parse_apply("filter(Price gt 10)/orderby(Name desc)/skip(1)/top(2)").unwrap();
        assert_eq!(p.len(), 4);
        assert!(matches!(p[0], Transformation::Filter(_)));
        assert!(matches!(p[2], Transformation::Skip(1)));
        assert!(matches!(p[3], Transformation::Top(2)));
    }

    #[test]
    fn hierarchy_functions() {
        let p = parse_apply(
            "descendants($root/Nodes,NodeHierarchy,ID,filter(ID eq 'A'),1,keep start)/orderby(ID)",
        )
        .unwrap();
        let Transformation::Descendants(step) = &p[0] else { panic!() };
        assert_eq!(step.qualifier, "NodeHierarchy");
        assert_eq!(step.max_distance, Some(1));
        assert!(step.keep_start);
        assert_eq!(step.input.len(), 1);

        let p = parse_apply(
            "com.sap.vocabularies.Hierarchy.v1.TopLevels(HierarchyNodes=$root/Nodes,HierarchyQualifier='NodeHierarchy',NodeProperty='ID',Levels=2,ExpandLevels=[{\"NodeID\":\"B\",\"Levels\":1}],Show=['C'],SkipLocation='B')",
        )
        .unwrap();
        let Transformation::TopLevels(t) = &p[0] else { panic!() };
        assert_eq!(t.levels, Some(2));
        assert_eq!(t.expand_levels, vec![("B".to_string(), Some(1))]);
        assert_eq!(t.show, vec!["C".to_string()]);
        assert_eq!(t.skip_location.as_deref(), Some("B"));
    }

    #[test]
    fn unknown_transformations_are_skipped() {
        let p = parse_apply("frobnicate(x)/top(3)").unwrap();
        assert_eq!(p, vec![Transformation::Top(3)]);
        assert!(parse_apply("filter(Name eq 'x)").is_err());
    }
}
