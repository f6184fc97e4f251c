//! Service description validation: referential integrity between types, sets and actions.

use crate::config::resolved::short_type_name;
use crate::config::ServiceConfig;
use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashSet;

/// OData simple identifier: letter or underscore, then letters, digits or underscores.
const IDENTIFIER_PATTERN: &str = r"^[\p{L}_][\p{L}\p{N}_]{0,127}$";

/// Draft sets keep active and inactive versions side by side, told apart by this key.
const IS_ACTIVE_ENTITY_KEY: &str = "IsActiveEntity";

fn check_identifier(re: &Regex, kind: &str, name: &str) -> Result<(), ConfigError> {
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{} name '{}' is not a valid identifier", kind, name)))
    }
}

pub fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
    let identifier = Regex::new(IDENTIFIER_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    for t in &config.entity_types {
        check_identifier(&identifier, "entity type", &t.name)?;
        for p in &t.properties {
            check_identifier(&identifier, "property", &p.name)?;
        }
        for n in &t.navigation_properties {
            check_identifier(&identifier, "navigation property", &n.name)?;
        }
    }
    for s in &config.entity_sets {
        check_identifier(&identifier, "entity set", &s.name)?;
    }
    let entity_type_names: HashSet<&str> = config.entity_types.iter().map(|t| t.name.as_str()).collect();
    let complex_type_names: HashSet<&str> = config.complex_types.iter().map(|t| t.name.as_str()).collect();

    for t in &config.entity_types {
        if t.keys.is_empty() {
            return Err(ConfigError::Validation(format!("entity type {} declares no keys", t.name)));
        }
        let property_names: HashSet<&str> = t.properties.iter().map(|p| p.name.as_str()).collect();
        for key in &t.keys {
            if !property_names.contains(key.as_str()) {
                return Err(ConfigError::InvalidKey {
                    entity_type: t.name.clone(),
                    property: key.clone(),
                });
            }
        }
        for p in &t.properties {
            let type_name = short_type_name(&p.type_);
            if !type_name.starts_with("Edm.") && !complex_type_names.contains(type_name) {
                return Err(ConfigError::MissingReference {
                    kind: "complex type",
                    id: p.type_.clone(),
                });
            }
        }
        for nav in &t.navigation_properties {
            if !entity_type_names.contains(short_type_name(&nav.target_type)) {
                return Err(ConfigError::MissingReference {
                    kind: "entity type",
                    id: nav.target_type.clone(),
                });
            }
        }
        for h in &t.hierarchies {
            let nav = t
                .navigation_properties
                .iter()
                .find(|n| n.name == h.parent_navigation_property)
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "navigation property",
                    id: format!("{}/{}", t.name, h.parent_navigation_property),
                })?;
            if nav.referential_constraints.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "hierarchy {} on {}: parent navigation {} has no referential constraint",
                    h.qualifier, t.name, nav.name
                )));
            }
            if !property_names.contains(h.node_property.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "property",
                    id: format!("{}/{}", t.name, h.node_property),
                });
            }
        }
    }

    for c in &config.complex_types {
        for p in &c.properties {
            let type_name = short_type_name(&p.type_);
            if !type_name.starts_with("Edm.") && !complex_type_names.contains(type_name) {
                return Err(ConfigError::MissingReference {
                    kind: "complex type",
                    id: p.type_.clone(),
                });
            }
        }
    }

    let set_names: HashSet<&str> = config.entity_sets.iter().map(|s| s.name.as_str()).collect();
    let mut seen = HashSet::new();
    for set in &config.entity_sets {
        if !seen.insert(set.name.as_str()) {
            return Err(ConfigError::DuplicateEntitySet(set.name.clone()));
        }
        let entity_type = config
            .entity_types
            .iter()
            .find(|t| t.name == short_type_name(&set.entity_type))
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "entity type",
                id: set.entity_type.clone(),
            })?;
        for (nav, target) in &set.navigation_bindings {
            if !entity_type.navigation_properties.iter().any(|n| &n.name == nav) {
                return Err(ConfigError::MissingReference {
                    kind: "navigation property",
                    id: format!("{}/{}", set.name, nav),
                });
            }
            if !set_names.contains(target.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "entity set",
                    id: target.clone(),
                });
            }
        }
        if let Some(draft) = &set.draft {
            if draft.root == draft.node {
                return Err(ConfigError::Validation(format!(
                    "entity set {}: draft must be exactly one of root or node",
                    set.name
                )));
            }
            if !entity_type.keys.iter().any(|k| k == IS_ACTIVE_ENTITY_KEY) {
                return Err(ConfigError::InvalidKey {
                    entity_type: entity_type.name.clone(),
                    property: IS_ACTIVE_ENTITY_KEY.to_string(),
                });
            }
        }
    }

    for action in &config.actions {
        if action.is_bound {
            let binding = action.binding_type.as_deref().ok_or_else(|| {
                ConfigError::Validation(format!("bound action {} has no binding type", action.name))
            })?;
            if !entity_type_names.contains(short_type_name(binding)) {
                return Err(ConfigError::MissingReference {
                    kind: "entity type",
                    id: binding.to_string(),
                });
            }
        }
        if let Some(set) = &action.entity_set {
            if !set_names.contains(set.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "entity set",
                    id: set.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: serde_json::Value) -> ServiceConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn rejects_key_that_is_not_a_property() {
        let c = config(serde_json::json!({
            "entity_types": [{ "name": "A", "keys": ["ID"], "properties": [{ "name": "Name", "type": "Edm.String" }] }]
        }));
        assert!(matches!(validate(&c), Err(ConfigError::InvalidKey { .. })));
    }

    #[test]
    fn rejects_names_that_are_not_identifiers() {
        let c = config(serde_json::json!({
            "entity_types": [{ "name": "A", "keys": ["ID"], "properties": [{ "name": "ID", "type": "Edm.Int32" }] }],
            "entity_sets": [{ "name": "My Set", "entity_type": "A" }]
        }));
        assert!(matches!(validate(&c), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn draft_sets_need_the_active_flag_in_their_keys() {
        let mut c = serde_json::json!({
            "entity_types": [{
                "name": "Form", "keys": ["ID"],
                "properties": [{ "name": "ID", "type": "Edm.Int32" }, { "name": "IsActiveEntity", "type": "Edm.Boolean" }]
            }],
            "entity_sets": [{ "name": "Forms", "entity_type": "Form", "draft": { "root": true } }]
        });
        match validate(&config(c.clone())) {
            Err(ConfigError::InvalidKey { entity_type, property }) => {
                assert_eq!(entity_type, "Form");
                assert_eq!(property, "IsActiveEntity");
            }
            other => panic!("unexpected {:?}", other),
        }
        c["entity_types"][0]["keys"] = serde_json::json!(["ID", "IsActiveEntity"]);
        assert!(validate(&config(c)).is_ok());
    }

    #[test]
    fn rejects_duplicate_entity_sets() {
        let c = config(serde_json::json!({
            "entity_types": [{ "name": "A", "keys": ["ID"], "properties": [{ "name": "ID", "type": "Edm.Int32" }] }],
            "entity_sets": [{ "name": "As", "entity_type": "A" }, { "name": "As", "entity_type": "A" }]
        }));
        assert!(matches!(validate(&c), Err(ConfigError::DuplicateEntitySet(_))));
    }

    #[test]
    fn rejects_unknown_binding_target() {
        let c = config(serde_json::json!({
            "entity_types": [{
                "name": "A", "keys": ["ID"],
                "properties": [{ "name": "ID", "type": "Edm.Int32" }],
                "navigation_properties": [{ "name": "toA", "target_type": "A" }]
            }],
            "entity_sets": [{ "name": "As", "entity_type": "A", "navigation_bindings": { "toA": "Missing" } }]
        }));
        assert!(matches!(validate(&c), Err(ConfigError::MissingReference { kind: "entity set", .. })));
    }
}
