//! Hierarchy engine: `TopLevels`, `descendants` and `ancestors` over an out-of-band tree index.

use crate::config::RecursiveHierarchy;
use crate::query::{HierarchyStep, TopLevels};
use crate::store::{node_id, FlattenOptions, HierarchyTree, Record};
use serde_json::json;
use std::collections::{HashMap, HashSet};

/// Ids of `rows` under the hierarchy's node property.
fn ids(rows: &[Record], hierarchy: &RecursiveHierarchy) -> HashSet<String> {
    rows.iter()
        .filter_map(|r| node_id(r.get(&hierarchy.node_property)))
        .collect()
}

/// Full collection with rows from `current` replacing their stored counterparts, so annotations
/// added earlier in the pipeline survive.
fn overlay(all_rows: &[Record], current: &[Record], hierarchy: &RecursiveHierarchy) -> Vec<Record> {
    let by_id: HashMap<String, &Record> = current
        .iter()
        .filter_map(|r| node_id(r.get(&hierarchy.node_property)).map(|id| (id, r)))
        .collect();
    all_rows
        .iter()
        .map(|r| {
            node_id(r.get(&hierarchy.node_property))
                .and_then(|id| by_id.get(&id))
                .map(|c| (*c).clone())
                .unwrap_or_else(|| r.clone())
        })
        .collect()
}

/// Roots of the current result set flattened to the requested depth, honoring explicit expand,
/// collapse and show lists. A skip location drops the rows before the marked node.
pub fn top_levels(all_rows: &[Record], current: &[Record], hierarchy: &RecursiveHierarchy, params: &TopLevels) -> Vec<Record> {
    let in_set = ids(current, hierarchy);
    let rows = overlay(all_rows, current, hierarchy);
    let tree = HierarchyTree::build(&rows, hierarchy, Some(&in_set));
    let mut options = FlattenOptions {
        levels: params.levels,
        show: params.show.iter().cloned().collect(),
        ..Default::default()
    };
    for (id, levels) in &params.expand_levels {
        match levels {
            Some(0) => {
                options.collapse.insert(id.clone());
            }
            other => {
                options.expand.insert(id.clone(), *other);
            }
        }
    }
    let mut out = tree.flatten(&tree.roots(), &options, hierarchy);
    if let Some(marker) = &params.skip_location {
        match out.iter().position(|r| node_id(r.get(&hierarchy.node_property)).as_deref() == Some(marker.as_str())) {
            Some(start) => {
                out.drain(..start);
            }
            None => tracing::debug!(node = %marker, "skip location not in flattened output"),
        }
    }
    tracing::debug!(qualifier = %hierarchy.qualifier, nodes = tree.len(), emitted = out.len(), "TopLevels flattened");
    out
}

/// Members of `current` that descend from a start node (within `max_distance`), in input order.
pub fn descendants(
    all_rows: &[Record],
    current: &[Record],
    start: &[Record],
    hierarchy: &RecursiveHierarchy,
    step: &HierarchyStep,
) -> Vec<Record> {
    let tree = HierarchyTree::build(all_rows, hierarchy, None);
    let start_ids = ids(start, hierarchy);
    let mut keep: HashSet<String> = HashSet::new();
    for id in &start_ids {
        if let Some(idx) = tree.index_of(id) {
            keep.extend(tree.descendants(idx, step.max_distance).into_iter().map(|i| tree.nodes[i].id.clone()));
        }
    }
    if step.keep_start {
        keep.extend(start_ids.iter().cloned());
    }
    current
        .iter()
        .filter(|r| node_id(r.get(&hierarchy.node_property)).map(|id| keep.contains(&id)).unwrap_or(false))
        .cloned()
        .collect()
}

/// Members of `current` that are ancestors of a start node (within `max_distance`), in input order.
/// Each output row is annotated with whether it matched and how many matches lie below it.
pub fn ancestors(
    all_rows: &[Record],
    current: &[Record],
    start: &[Record],
    hierarchy: &RecursiveHierarchy,
    step: &HierarchyStep,
) -> Vec<Record> {
    let tree = HierarchyTree::build(all_rows, hierarchy, None);
    let start_ids = ids(start, hierarchy);
    let mut keep: HashSet<String> = HashSet::new();
    let mut matched_below: HashMap<String, usize> = HashMap::new();
    for id in &start_ids {
        let Some(idx) = tree.index_of(id) else {
            continue;
        };
        for (distance, ancestor) in tree.ancestors(idx).into_iter().enumerate() {
            if step.max_distance.map(|m| distance + 1 > m).unwrap_or(false) {
                break;
            }
            let ancestor_id = tree.nodes[ancestor].id.clone();
            *matched_below.entry(ancestor_id.clone()).or_insert(0) += 1;
            keep.insert(ancestor_id);
        }
    }
    if step.keep_start {
        keep.extend(start_ids.iter().cloned());
    }
    current
        .iter()
        .filter_map(|r| {
            let id = node_id(r.get(&hierarchy.node_property))?;
            if !keep.contains(&id) {
                return None;
            }
            let mut row = r.clone();
            row.insert(hierarchy.matched_property.clone(), json!(start_ids.contains(&id)));
            row.insert(
                hierarchy.matched_descendant_count_property.clone(),
                json!(matched_below.get(&id).copied().unwrap_or(0)),
            );
            Some(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn hierarchy() -> RecursiveHierarchy {
        RecursiveHierarchy {
            qualifier: "OrgHierarchy".into(),
            node_property: "ID".into(),
            parent_navigation_property: "Superordinate".into(),
            parent_property: "ParentID".into(),
            distance_from_root_property: "DistanceFromRoot".into(),
            drill_state_property: "DrillState".into(),
            limited_descendant_count_property: "LimitedDescendantCount".into(),
            matched_property: "Matched".into(),
            matched_descendant_count_property: "MatchedDescendantCount".into(),
        }
    }

    fn rows() -> Vec<Record> {
        [("World", None), ("EMEA", Some("World")), ("DE", Some("EMEA")), ("FR", Some("EMEA")), ("US", Some("World"))]
            .iter()
            .map(|(id, parent)| json!({ "ID": id, "ParentID": parent }).as_object().cloned().unwrap())
            .collect()
    }

    fn step(keep_start: bool, max_distance: Option<usize>) -> HierarchyStep {
        HierarchyStep {
            hierarchy_root: "$root/Orgs".into(),
            qualifier: "OrgHierarchy".into(),
            node_property: "ID".into(),
            input: Vec::new(),
            max_distance,
            keep_start,
        }
    }

    fn ids_of(rows: &[Record]) -> Vec<&str> {
        rows.iter().map(|r| r["ID"].as_str().unwrap()).collect()
    }

    #[test]
    fn top_levels_honors_levels_and_expand() {
        let all = rows();
        let params = TopLevels {
            hierarchy_root: "$root/Orgs".into(),
            qualifier: "OrgHierarchy".into(),
            node_property: "ID".into(),
            levels: Some(2),
            expand_levels: vec![("EMEA".into(), Some(1))],
            show: Vec::new(),
            skip_location: None,
        };
        let out = top_levels(&all, &all, &hierarchy(), &params);
        assert_eq!(ids_of(&out), vec!["World", "EMEA", "DE", "FR", "US"]);
        assert_eq!(out[1]["DrillState"], Value::from("expanded"));
        assert_eq!(out[0]["LimitedDescendantCount"], Value::from(4));
    }

    #[test]
    fn collapse_through_zero_levels() {
        let all = rows();
        let params = TopLevels {
            hierarchy_root: "$root/Orgs".into(),
            qualifier: "OrgHierarchy".into(),
            node_property: "ID".into(),
            levels: None,
            expand_levels: vec![("EMEA".into(), Some(0))],
            show: Vec::new(),
            skip_location: None,
        };
        let out = top_levels(&all, &all, &hierarchy(), &params);
        assert_eq!(ids_of(&out), vec!["World", "EMEA", "US"]);
        assert_eq!(out[1]["DrillState"], Value::from("collapsed"));
    }

    #[test]
    fn skip_location_starts_the_window_at_the_marked_node() {
        let all = rows();
        let mut params = TopLevels {
            hierarchy_root: "$root/Orgs".into(),
            qualifier: "OrgHierarchy".into(),
            node_property: "ID".into(),
            levels: None,
            expand_levels: Vec::new(),
            show: Vec::new(),
            skip_location: Some("DE".into()),
        };
        let out = top_levels(&all, &all, &hierarchy(), &params);
        assert_eq!(ids_of(&out), vec!["DE", "FR", "US"]);
        assert_eq!(out[0]["DistanceFromRoot"], Value::from(2));

        params.skip_location = Some("Nowhere".into());
        assert_eq!(top_levels(&all, &all, &hierarchy(), &params).len(), 5);
    }

    #[test]
    fn descendants_with_and_without_start() {
        let all = rows();
        let start = vec![all[1].clone()];
        assert_eq!(ids_of(&descendants(&all, &all, &start, &hierarchy(), &step(false, None))), vec!["DE", "FR"]);
        assert_eq!(
            ids_of(&descendants(&all, &all, &start, &hierarchy(), &step(true, Some(1)))),
            vec!["EMEA", "DE", "FR"]
        );
    }

    #[test]
    fn ancestors_mark_matches() {
        let all = rows();
        let start = vec![all[2].clone(), all[3].clone()];
        let out = ancestors(&all, &all, &start, &hierarchy(), &step(true, None));
        assert_eq!(ids_of(&out), vec!["World", "EMEA", "DE", "FR"]);
        assert_eq!(out[0]["Matched"], Value::from(false));
        assert_eq!(out[0]["MatchedDescendantCount"], Value::from(2));
        assert_eq!(out[2]["Matched"], Value::from(true));
    }
}
