//! Hierarchy trees kept in an index beside the rows, so tree links never leak into stored records.

use crate::config::RecursiveHierarchy;
use crate::store::Record;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub id: String,
    pub row: Record,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub distance_from_root: usize,
    pub in_result_set: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrillState {
    Leaf,
    Collapsed,
    Expanded,
}

impl DrillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrillState::Leaf => "leaf",
            DrillState::Collapsed => "collapsed",
            DrillState::Expanded => "expanded",
        }
    }
}

/// How far a flatten walk goes.
#[derive(Clone, Debug, Default)]
pub struct FlattenOptions {
    /// Levels shown below (and including) the roots; `None` shows everything.
    pub levels: Option<usize>,
    /// Node id -> extra levels to expand below it (`None` = all).
    pub expand: HashMap<String, Option<usize>>,
    pub collapse: HashSet<String>,
    /// Nodes that must be visible; their ancestors are expanded.
    pub show: HashSet<String>,
}

#[derive(Clone, Debug, Default)]
pub struct HierarchyTree {
    pub nodes: Vec<TreeNode>,
    index: HashMap<String, usize>,
}

/// String form of a node id value, used as the tree index key.
pub fn node_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl HierarchyTree {
    /// Link every row to its parent through the hierarchy's parent property.
    /// `in_result_set` marks the subset currently selected; `None` marks all rows.
    pub fn build(rows: &[Record], hierarchy: &RecursiveHierarchy, in_result_set: Option<&HashSet<String>>) -> Self {
        let mut tree = HierarchyTree::default();
        for row in rows {
            let Some(id) = node_id(row.get(&hierarchy.node_property)) else {
                continue;
            };
            if tree.index.contains_key(&id) {
                continue;
            }
            let in_set = in_result_set.map(|s| s.contains(&id)).unwrap_or(true);
            tree.index.insert(id.clone(), tree.nodes.len());
            tree.nodes.push(TreeNode {
                id,
                row: row.clone(),
                parent: None,
                children: Vec::new(),
                distance_from_root: 0,
                in_result_set: in_set,
            });
        }
        for i in 0..tree.nodes.len() {
            let parent_id = node_id(tree.nodes[i].row.get(&hierarchy.parent_property));
            if let Some(p) = parent_id.and_then(|pid| tree.index.get(&pid).copied()) {
                if p != i {
                    tree.nodes[i].parent = Some(p);
                    tree.nodes[p].children.push(i);
                }
            }
        }
        for i in 0..tree.nodes.len() {
            let mut distance = 0;
            let mut current = tree.nodes[i].parent;
            while let Some(p) = current {
                distance += 1;
                if distance > tree.nodes.len() {
                    tracing::warn!(node = %tree.nodes[i].id, "cycle in hierarchy parent chain");
                    break;
                }
                current = tree.nodes[p].parent;
            }
            tree.nodes[i].distance_from_root = distance;
        }
        tree
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// In-result-set nodes without an in-result-set parent, in row order.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| {
                let n = &self.nodes[i];
                n.in_result_set && n.parent.map(|p| !self.nodes[p].in_result_set).unwrap_or(true)
            })
            .collect()
    }

    pub fn result_children(&self, idx: usize) -> Vec<usize> {
        self.nodes[idx]
            .children
            .iter()
            .copied()
            .filter(|&c| self.nodes[c].in_result_set)
            .collect()
    }

    /// Ancestor chain of a node, nearest first.
    pub fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = self.nodes[idx].parent;
        while let Some(p) = current {
            if out.contains(&p) {
                break;
            }
            out.push(p);
            current = self.nodes[p].parent;
        }
        out
    }

    /// Descendants of a node in pre-order, down to `max_distance` levels below it.
    pub fn descendants(&self, idx: usize, max_distance: Option<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, usize)> = self.nodes[idx].children.iter().rev().map(|&c| (c, 1)).collect();
        while let Some((node, depth)) = stack.pop() {
            if max_distance.map(|m| depth > m).unwrap_or(false) || out.len() >= self.nodes.len() {
                continue;
            }
            out.push(node);
            stack.extend(self.nodes[node].children.iter().rev().map(|&c| (c, depth + 1)));
        }
        out
    }

    /// Depth-limited pre-order walk from `roots`, writing drill state, distance and descendant count
    /// into clones of the rows.
    pub fn flatten(&self, roots: &[usize], options: &FlattenOptions, hierarchy: &RecursiveHierarchy) -> Vec<Record> {
        let mut must_expand = HashSet::new();
        for id in &options.show {
            if let Some(idx) = self.index_of(id) {
                must_expand.extend(self.ancestors(idx));
            }
        }
        let mut out: Vec<Record> = Vec::new();
        let mut stack: Vec<Walk> = roots
            .iter()
            .rev()
            .map(|&idx| Walk::Enter {
                idx,
                distance: 0,
                forced_levels: 0,
            })
            .collect();
        while let Some(step) = stack.pop() {
            let (idx, distance, forced_levels) = match step {
                Walk::Leave { position } => {
                    let descendant_count = out.len() - position - 1;
                    out[position].insert(
                        hierarchy.limited_descendant_count_property.clone(),
                        json!(descendant_count),
                    );
                    continue;
                }
                Walk::Enter { idx, distance, forced_levels } => (idx, distance, forced_levels),
            };
            if distance > self.nodes.len() {
                continue;
            }
            let node = &self.nodes[idx];
            let children = self.result_children(idx);
            let explicit = options.expand.get(&node.id);
            let expanded = if children.is_empty() {
                false
            } else if must_expand.contains(&idx) {
                true
            } else if options.collapse.contains(&node.id) {
                false
            } else {
                explicit.is_some() || forced_levels > 0 || options.levels.map(|l| distance + 1 < l).unwrap_or(true)
            };
            let drill_state = if children.is_empty() {
                DrillState::Leaf
            } else if expanded {
                DrillState::Expanded
            } else {
                DrillState::Collapsed
            };

            let mut row = node.row.clone();
            row.insert(hierarchy.distance_from_root_property.clone(), json!(distance));
            row.insert(hierarchy.drill_state_property.clone(), json!(drill_state.as_str()));
            stack.push(Walk::Leave { position: out.len() });
            out.push(row);

            if expanded {
                let from_explicit = match explicit {
                    Some(Some(levels)) => levels.saturating_sub(1),
                    Some(None) => usize::MAX,
                    None => 0,
                };
                let child_forced = forced_levels.saturating_sub(1).max(from_explicit);
                stack.extend(children.into_iter().rev().map(|c| Walk::Enter {
                    idx: c,
                    distance: distance + 1,
                    forced_levels: child_forced,
                }));
            }
        }
        out
    }
}

/// Flatten work item: emit a node, or close it once its subtree is written.
enum Walk {
    Enter { idx: usize, distance: usize, forced_levels: usize },
    Leave { position: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> RecursiveHierarchy {
        RecursiveHierarchy {
            qualifier: "H".into(),
            node_property: "ID".into(),
            parent_navigation_property: "Superordinate".into(),
            parent_property: "Parent".into(),
            distance_from_root_property: "DistanceFromRoot".into(),
            drill_state_property: "DrillState".into(),
            limited_descendant_count_property: "LimitedDescendantCount".into(),
            matched_property: "Matched".into(),
            matched_descendant_count_property: "MatchedDescendantCount".into(),
        }
    }

    fn rows() -> Vec<Record> {
        [("A", None), ("B", Some("A")), ("C", Some("B")), ("D", Some("A")), ("E", None)]
            .iter()
            .map(|(id, parent)| {
                serde_json::json!({ "ID": id, "Parent": parent })
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn build_links_parents_and_distances() {
        let tree = HierarchyTree::build(&rows(), &hierarchy(), None);
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.node("C").unwrap().distance_from_root, 2);
        assert_eq!(tree.roots().len(), 2);
        let a = tree.index_of("A").unwrap();
        assert_eq!(tree.descendants(a, None).len(), 3);
        assert_eq!(tree.descendants(a, Some(1)).len(), 2);
    }

    #[test]
    fn flatten_respects_levels() {
        let h = hierarchy();
        let tree = HierarchyTree::build(&rows(), &h, None);
        let options = FlattenOptions { levels: Some(1), ..Default::default() };
        let out = tree.flatten(&tree.roots(), &options, &h);
        let ids: Vec<&str> = out.iter().map(|r| r["ID"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["A", "E"]);
        assert_eq!(out[0]["DrillState"], "collapsed");
        assert_eq!(out[1]["DrillState"], "leaf");
    }

    #[test]
    fn show_forces_ancestors_open() {
        let h = hierarchy();
        let tree = HierarchyTree::build(&rows(), &h, None);
        let options = FlattenOptions {
            levels: Some(1),
            show: ["C".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let out = tree.flatten(&tree.roots(), &options, &h);
        let ids: Vec<&str> = out.iter().map(|r| r["ID"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(out[0]["LimitedDescendantCount"], 3);
        assert_eq!(out[2]["DistanceFromRoot"], 2);
    }

    #[test]
    fn deep_chains_flatten_without_recursion() {
        let h = hierarchy();
        let chain: Vec<Record> = (0..10_000)
            .map(|i| {
                let parent = if i == 0 { Value::Null } else { json!(format!("N{}", i - 1)) };
                json!({ "ID": format!("N{}", i), "Parent": parent }).as_object().cloned().unwrap()
            })
            .collect();
        let tree = HierarchyTree::build(&chain, &h, None);
        let out = tree.flatten(&tree.roots(), &FlattenOptions::default(), &h);
        assert_eq!(out.len(), 10_000);
        assert_eq!(out[0]["LimitedDescendantCount"], 9_999);
        assert_eq!(out[9_999]["DistanceFromRoot"], 9_999);
        assert_eq!(out[9_999]["DrillState"], "leaf");
        assert_eq!(tree.descendants(0, None).len(), 9_999);
    }

    #[test]
    fn collapse_wins_over_levels() {
        let h = hierarchy();
        let tree = HierarchyTree::build(&rows(), &h, None);
        let options = FlattenOptions {
            levels: None,
            collapse: ["A".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let out = tree.flatten(&tree.roots(), &options, &h);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["DrillState"], "collapsed");
    }
}
