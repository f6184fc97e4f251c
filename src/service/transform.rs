//! Executes a parsed `$apply` pipeline over an in-memory result set.

use crate::config::{short_type_name, EntityType, RecursiveHierarchy};
use crate::query::{OrderBy, SortDirection, Transformation};
use crate::service::aggregate::{aggregate, group_rows, CustomAggregate};
use crate::service::evaluator::{compare_values, evaluate, matches_search, value_at, EvalContext};
use crate::service::hierarchy;
use crate::store::Record;
use std::cmp::Ordering;

pub struct TransformContext<'a> {
    pub eval: EvalContext<'a>,
    pub entity_type: &'a EntityType,
    /// Whole collection, needed to link hierarchy nodes outside the current result set.
    pub all_rows: &'a [Record],
    pub custom: CustomAggregate<'a>,
}

/// Stable multi-key sort; the first key that differs decides.
pub fn sort_rows(rows: &mut [Record], order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for o in order {
            let ordering = compare_values(
                value_at(a, &o.property).as_deref(),
                value_at(b, &o.property).as_deref(),
            );
            let ordering = match o.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Run every transformation in order.
pub fn apply_pipeline(rows: Vec<Record>, pipeline: &[Transformation], ctx: &TransformContext) -> Vec<Record> {
    pipeline.iter().fold(rows, |rows, t| apply_one(rows, t, ctx))
}

fn hierarchy_for<'a>(ctx: &TransformContext<'a>, qualifier: &str) -> Option<&'a RecursiveHierarchy> {
    let found = ctx.entity_type.hierarchy(short_type_name(qualifier));
    if found.is_none() {
        tracing::warn!(qualifier = %qualifier, entity_type = %ctx.entity_type.name, "unknown hierarchy qualifier");
    }
    found
}

fn apply_one(mut rows: Vec<Record>, transformation: &Transformation, ctx: &TransformContext) -> Vec<Record> {
    match transformation {
        Transformation::Filter(expr) => {
            rows.retain(|r| evaluate(expr, r, &ctx.eval));
            rows
        }
        Transformation::Search(tokens) => {
            rows.retain(|r| matches_search(tokens, r, ctx.entity_type));
            rows
        }
        Transformation::OrderBy(order) => {
            sort_rows(&mut rows, order);
            rows
        }
        Transformation::Skip(n) => rows.into_iter().skip(*n).collect(),
        Transformation::Top(n) => rows.into_iter().take(*n).collect(),
        Transformation::Aggregate(expressions) => vec![aggregate(&rows, expressions, ctx.custom)],
        Transformation::GroupBy {
            properties,
            aggregates,
            nested,
        } => group_rows(rows, properties)
            .into_iter()
            .map(|(mut head, members)| {
                let members = apply_pipeline(members, nested, ctx);
                if !aggregates.is_empty() {
                    head.extend(aggregate(&members, aggregates, ctx.custom));
                }
                head
            })
            .collect(),
        Transformation::Concat(branches) => branches
            .iter()
            .flat_map(|branch| apply_pipeline(rows.clone(), branch, ctx))
            .collect(),
        Transformation::Descendants(step) => match hierarchy_for(ctx, &step.qualifier) {
            Some(h) => {
                let start = apply_pipeline(rows.clone(), &step.input, ctx);
                hierarchy::descendants(ctx.all_rows, &rows, &start, h, step)
            }
            None => rows,
        },
        Transformation::Ancestors(step) => match hierarchy_for(ctx, &step.qualifier) {
            Some(h) => {
                let start = apply_pipeline(rows.clone(), &step.input, ctx);
                hierarchy::ancestors(ctx.all_rows, &rows, &start, h, step)
            }
            None => rows,
        },
        Transformation::TopLevels(params) => match hierarchy_for(ctx, &params.qualifier) {
            Some(h) => hierarchy::top_levels(ctx.all_rows, &rows, h, params),
            None => rows,
        },
    }
}
