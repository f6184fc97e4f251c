//! Contained navigation targets: rows embedded in a parent row rather than stored in a set of their own.

use crate::config::EntityType;
use crate::store::{row_matches, KeyMap, Record};
use serde_json::Value;
use std::sync::Arc;

/// Read-only view over the rows a containment navigation holds on its parent.
pub struct ContainedEntitySet {
    entity_type: Arc<EntityType>,
    rows: Vec<Record>,
}

impl ContainedEntitySet {
    /// Accepts an embedded array, a single object, or a `{results: [...]}` wrapper. Anything else is empty.
    pub fn new(entity_type: Arc<EntityType>, embedded: Option<&Value>) -> Self {
        let rows = match embedded {
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
            Some(Value::Object(obj)) => match obj.get("results") {
                Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
                _ => vec![obj.clone()],
            },
            _ => Vec::new(),
        };
        ContainedEntitySet { entity_type, rows }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn get(&self, keys: &KeyMap) -> Vec<Record> {
        self.rows.iter().filter(|r| row_matches(r, keys)).cloned().collect()
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_type() -> Arc<EntityType> {
        Arc::new(EntityType {
            name: "Item".into(),
            keys: vec!["Pos".into()],
            properties: Vec::new(),
            navigation_properties: Vec::new(),
            hierarchies: Vec::new(),
            custom_aggregates: Default::default(),
        })
    }

    #[test]
    fn reads_arrays_and_result_wrappers() {
        let embedded = json!({ "results": [{ "Pos": 1 }, { "Pos": 2 }] });
        let set = ContainedEntitySet::new(item_type(), Some(&embedded));
        assert_eq!(set.get(&[("Pos".to_string(), json!("2"))].into()).len(), 1);
        assert_eq!(ContainedEntitySet::new(item_type(), Some(&json!([{ "Pos": 1 }]))).into_rows().len(), 1);
        assert!(ContainedEntitySet::new(item_type(), None).into_rows().is_empty());
    }
}
