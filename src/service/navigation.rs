//! Navigation key resolution: which target rows a navigation property reaches from a source row.

use crate::config::{short_type_name, EntityType, NavigationProperty};
use crate::store::{KeyMap, Record};
use serde_json::Value;

pub const SIBLING_ENTITY: &str = "SiblingEntity";
pub const DRAFT_ADMINISTRATIVE_DATA: &str = "DraftAdministrativeData";
pub const IS_ACTIVE_ENTITY: &str = "IsActiveEntity";

/// How target keys were found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySource {
    Constraints,
    Partner,
    Heuristic,
}

/// Key predicate selecting the rows `nav` reaches from `source_row`.
///
/// Tries the navigation's referential constraints, then the partner navigation's constraints read in
/// reverse, then (outside strict mode) the source keys that are also keys of the target type.
/// Returns `None` when nothing applies.
pub fn target_keys(
    source_type: &EntityType,
    nav: &NavigationProperty,
    target_type: &EntityType,
    source_row: &Record,
    strict: bool,
) -> Option<(KeyMap, KeySource)> {
    let value = |name: &str| source_row.get(name).cloned().unwrap_or(Value::Null);

    if !nav.referential_constraints.is_empty() {
        let keys = nav
            .referential_constraints
            .iter()
            .map(|c| (c.referenced_property.clone(), value(&c.property)))
            .collect();
        return Some((keys, KeySource::Constraints));
    }

    let partner = nav
        .partner
        .as_deref()
        .and_then(|p| target_type.navigation(p))
        .filter(|p| !p.referential_constraints.is_empty())
        .or_else(|| {
            target_type.navigation_properties.iter().find(|p| {
                short_type_name(&p.target_type) == source_type.name && !p.referential_constraints.is_empty()
            })
        });
    if let Some(partner) = partner {
        let keys = partner
            .referential_constraints
            .iter()
            .map(|c| (c.property.clone(), value(&c.referenced_property)))
            .collect();
        return Some((keys, KeySource::Partner));
    }

    if strict {
        tracing::warn!(
            navigation = %nav.name,
            source = %source_type.name,
            "no referential constraints; strict key mode resolves nothing"
        );
        return None;
    }
    let keys: KeyMap = source_type
        .business_keys()
        .filter(|k| target_type.is_key(k))
        .map(|k| (k.clone(), value(k)))
        .collect();
    if keys.is_empty() {
        return None;
    }
    Some((keys, KeySource::Heuristic))
}

/// Copies `IsActiveEntity` across a navigation between two draft-enabled sets.
pub fn carry_active_flag(keys: &mut KeyMap, source_row: &Record) {
    if let Some(active) = source_row.get(IS_ACTIVE_ENTITY) {
        keys.insert(IS_ACTIVE_ENTITY.to_string(), active.clone());
    }
}

/// Assignments to write into a new row created through `nav` beneath `parent_row`.
pub fn child_assignments(
    source_type: &EntityType,
    nav: &NavigationProperty,
    target_type: &EntityType,
    parent_row: &Record,
    strict: bool,
) -> Record {
    target_keys(source_type, nav, target_type, parent_row, strict)
        .map(|(keys, _)| keys.into_iter().filter(|(_, v)| !v.is_null()).collect())
        .unwrap_or_default()
}

/// Value of `IsActiveEntity` as a boolean, accepting `"true"`/`"false"` strings.
pub fn is_active(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ServiceConfig, ServiceSchema};
    use serde_json::json;

    fn schema() -> ServiceSchema {
        let config: ServiceConfig = serde_json::from_value(json!({
            "entity_types": [
                {
                    "name": "Order",
                    "keys": ["OrderID"],
                    "properties": [
                        { "name": "OrderID", "type": "Edm.Int32" },
                        { "name": "CustomerID", "type": "Edm.String" }
                    ],
                    "navigation_properties": [
                        { "name": "to_Customer", "target_type": "Customer",
                          "referential_constraints": [{ "property": "CustomerID", "referenced_property": "ID" }] },
                        { "name": "to_Items", "target_type": "Item", "is_collection": true, "partner": "to_Order" },
                        { "name": "to_Notes", "target_type": "Note", "is_collection": true }
                    ]
                },
                {
                    "name": "Customer",
                    "keys": ["ID"],
                    "properties": [{ "name": "ID", "type": "Edm.String" }]
                },
                {
                    "name": "Item",
                    "keys": ["ItemID"],
                    "properties": [{ "name": "ItemID", "type": "Edm.Int32" }, { "name": "ParentOrder", "type": "Edm.Int32" }],
                    "navigation_properties": [
                        { "name": "to_Order", "target_type": "Order",
                          "referential_constraints": [{ "property": "ParentOrder", "referenced_property": "OrderID" }] }
                    ]
                },
                {
                    "name": "Note",
                    "keys": ["OrderID", "NoteID"],
                    "properties": [{ "name": "OrderID", "type": "Edm.Int32" }, { "name": "NoteID", "type": "Edm.Int32" }]
                }
            ],
            "entity_sets": [
                { "name": "Orders", "entity_type": "Order" },
                { "name": "Customers", "entity_type": "Customer" },
                { "name": "Items", "entity_type": "Item" },
                { "name": "Notes", "entity_type": "Note" }
            ]
        }))
        .unwrap();
        resolve(&config).unwrap()
    }

    fn order() -> Record {
        json!({ "OrderID": 1, "CustomerID": "C1" }).as_object().cloned().unwrap()
    }

    fn resolve_nav(nav: &str, strict: bool) -> Option<(KeyMap, KeySource)> {
        let schema = schema();
        let source = schema.entity_type("Order").unwrap();
        let nav = source.navigation(nav).unwrap();
        let target = schema.entity_type(&nav.target_type).unwrap();
        target_keys(source, nav, target, &order(), strict)
    }

    #[test]
    fn constraints_then_partner_then_heuristic() {
        let (keys, source) = resolve_nav("to_Customer", true).unwrap();
        assert_eq!(source, KeySource::Constraints);
        assert_eq!(keys["ID"], json!("C1"));

        let (keys, source) = resolve_nav("to_Items", true).unwrap();
        assert_eq!(source, KeySource::Partner);
        assert_eq!(keys["ParentOrder"], json!(1));

        let (keys, source) = resolve_nav("to_Notes", false).unwrap();
        assert_eq!(source, KeySource::Heuristic);
        assert_eq!(keys["OrderID"], json!(1));
    }

    #[test]
    fn strict_mode_without_constraints_resolves_nothing() {
        assert!(resolve_nav("to_Notes", true).is_none());
    }

    #[test]
    fn active_flag_accepts_strings() {
        assert_eq!(is_active(Some(&json!("false"))), Some(false));
        assert_eq!(is_active(Some(&json!(true))), Some(true));
        assert_eq!(is_active(None), None);
    }
}
