//! Load a service description through the file loader and resolve it into a typed schema.

use crate::config::resolved::{
    short_type_name, Action, ActionParameter, ComplexType, DraftRole, DraftSettings, EdmType, EntitySetDef,
    EntityType, NavigationProperty, Property, RecursiveHierarchy, ReferentialConstraint, ServiceSchema,
    StickySettings,
};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use crate::files::FileLoader;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Build the resolved schema from a service description (validates first).
pub fn resolve(config: &ServiceConfig) -> Result<ServiceSchema, ConfigError> {
    validate(config)?;

    let complex_types: HashMap<String, Arc<ComplexType>> = config
        .complex_types
        .iter()
        .map(|c| {
            (
                c.name.clone(),
                Arc::new(ComplexType {
                    name: c.name.clone(),
                    properties: c.properties.iter().map(resolve_property).collect(),
                }),
            )
        })
        .collect();

    let mut entity_types = HashMap::new();
    for t in &config.entity_types {
        let navigation_properties: Vec<NavigationProperty> = t
            .navigation_properties
            .iter()
            .map(|n| NavigationProperty {
                name: n.name.clone(),
                target_type: short_type_name(&n.target_type).to_string(),
                is_collection: n.is_collection,
                partner: n.partner.clone(),
                contains_target: n.contains_target,
                referential_constraints: n
                    .referential_constraints
                    .iter()
                    .map(|c| ReferentialConstraint {
                        property: c.property.clone(),
                        referenced_property: c.referenced_property.clone(),
                    })
                    .collect(),
            })
            .collect();
        let hierarchies = t
            .hierarchies
            .iter()
            .map(|h| resolve_hierarchy(h, &navigation_properties))
            .collect::<Result<Vec<_>, _>>()?;
        let entity_type = EntityType {
            name: t.name.clone(),
            keys: t.keys.clone(),
            properties: t.properties.iter().map(resolve_property).collect(),
            navigation_properties,
            hierarchies,
            custom_aggregates: t.custom_aggregates.iter().cloned().collect(),
        };
        entity_types.insert(t.name.clone(), Arc::new(entity_type));
    }

    let mut entity_sets = Vec::new();
    let mut entity_set_by_name = HashMap::new();
    for s in &config.entity_sets {
        let entity_type = entity_types
            .get(short_type_name(&s.entity_type))
            .cloned()
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "entity type",
                id: s.entity_type.clone(),
            })?;
        let set = Arc::new(EntitySetDef {
            name: s.name.clone(),
            entity_type,
            singleton: s.singleton,
            parametrized: s.parametrized,
            navigation_bindings: s.navigation_bindings.clone(),
            draft: s.draft.as_ref().map(|d| DraftSettings {
                role: if d.root { DraftRole::Root } else { DraftRole::Node },
                activation_action: d.activation_action.clone(),
                edit_action: d.edit_action.clone(),
                prepare_action: d.prepare_action.clone(),
                discard_action: d.discard_action.clone(),
            }),
            sticky: s.sticky.as_ref().map(|st| StickySettings {
                new_action: st.new_action.clone(),
                edit_action: st.edit_action.clone(),
                save_action: st.save_action.clone(),
                discard_action: st.discard_action.clone(),
            }),
        });
        entity_set_by_name.insert(s.name.clone(), set.clone());
        entity_sets.push(set);
    }

    let actions = config
        .actions
        .iter()
        .map(|a| Action {
            name: a.name.clone(),
            is_bound: a.is_bound,
            binding_type: a.binding_type.as_deref().map(|b| short_type_name(b).to_string()),
            binding_is_collection: a.binding_is_collection,
            is_function: a.is_function,
            parameters: a
                .parameters
                .iter()
                .map(|p| ActionParameter {
                    name: p.name.clone(),
                    type_name: p.type_.clone(),
                    nullable: p.nullable,
                })
                .collect(),
            return_type: a.return_type.clone(),
            entity_set: a.entity_set.clone(),
        })
        .collect();

    Ok(ServiceSchema {
        namespace: config.namespace.clone(),
        version: config.version,
        entity_types,
        complex_types,
        entity_sets,
        entity_set_by_name,
        actions,
    })
}

fn resolve_property(p: &PropertyConfig) -> Property {
    let is_collection = p.is_collection || p.type_.starts_with("Collection(");
    let type_name = short_type_name(&p.type_).to_string();
    Property {
        name: p.name.clone(),
        edm_type: EdmType::parse(&type_name),
        type_name,
        nullable: p.nullable,
        max_length: p.max_length,
        precision: p.precision,
        scale: p.scale,
        computed: p.computed,
        is_collection,
    }
}

fn resolve_hierarchy(
    h: &HierarchyConfig,
    navigation_properties: &[NavigationProperty],
) -> Result<RecursiveHierarchy, ConfigError> {
    let parent_property = navigation_properties
        .iter()
        .find(|n| n.name == h.parent_navigation_property)
        .and_then(|n| n.referential_constraints.first())
        .map(|c| c.property.clone())
        .ok_or_else(|| ConfigError::MissingReference {
            kind: "hierarchy parent navigation",
            id: h.parent_navigation_property.clone(),
        })?;
    let field = |value: &Option<String>, default: &str| value.clone().unwrap_or_else(|| default.to_string());
    Ok(RecursiveHierarchy {
        qualifier: h.qualifier.clone(),
        node_property: h.node_property.clone(),
        parent_navigation_property: h.parent_navigation_property.clone(),
        parent_property,
        distance_from_root_property: field(&h.distance_from_root_property, "DistanceFromRoot"),
        drill_state_property: field(&h.drill_state_property, "DrillState"),
        limited_descendant_count_property: field(&h.limited_descendant_count_property, "LimitedDescendantCount"),
        matched_property: field(&h.matched_property, "Matched"),
        matched_descendant_count_property: field(&h.matched_descendant_count_property, "MatchedDescendantCount"),
    })
}

/// Read a JSON service description through the file loader.
pub async fn load_service_config(loader: &dyn FileLoader, path: &Path) -> Result<ServiceConfig, ConfigError> {
    let text = loader
        .read_text(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), bytes = text.len(), "service description read");
    serde_json::from_str(&text).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
}

/// Load and resolve in one step.
pub async fn load_schema(loader: &dyn FileLoader, path: &Path) -> Result<ServiceSchema, ConfigError> {
    let config = load_service_config(loader, path).await?;
    resolve(&config)
}
