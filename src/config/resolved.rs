//! Resolved service schema: description validated and cross-referenced for runtime use.

use crate::config::ODataVersion;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Primitive type of a property, parsed from its `Edm.*` name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdmType {
    String,
    Boolean,
    Byte,
    SByte,
    Int16,
    Int32,
    Int64,
    Decimal,
    Double,
    Single,
    Guid,
    Date,
    DateTime,
    DateTimeOffset,
    TimeOfDay,
    Binary,
    /// Structured value; the type name lives on the property.
    Complex,
    Other,
}

impl EdmType {
    pub fn parse(type_name: &str) -> EdmType {
        match type_name.strip_prefix("Edm.") {
            Some("String") => EdmType::String,
            Some("Boolean") => EdmType::Boolean,
            Some("Byte") => EdmType::Byte,
            Some("SByte") => EdmType::SByte,
            Some("Int16") => EdmType::Int16,
            Some("Int32") => EdmType::Int32,
            Some("Int64") => EdmType::Int64,
            Some("Decimal") => EdmType::Decimal,
            Some("Double") => EdmType::Double,
            Some("Single") => EdmType::Single,
            Some("Guid") => EdmType::Guid,
            Some("Date") => EdmType::Date,
            Some("DateTime") => EdmType::DateTime,
            Some("DateTimeOffset") => EdmType::DateTimeOffset,
            Some("TimeOfDay") | Some("Time") => EdmType::TimeOfDay,
            Some("Binary") | Some("Stream") => EdmType::Binary,
            Some(_) => EdmType::Other,
            None => EdmType::Complex,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            EdmType::Byte
                | EdmType::SByte
                | EdmType::Int16
                | EdmType::Int32
                | EdmType::Int64
                | EdmType::Decimal
                | EdmType::Double
                | EdmType::Single
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            EdmType::Byte | EdmType::SByte | EdmType::Int16 | EdmType::Int32 | EdmType::Int64
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, EdmType::Date | EdmType::DateTime | EdmType::DateTimeOffset)
    }
}

#[derive(Clone, Debug)]
pub struct Property {
    pub name: String,
    pub edm_type: EdmType,
    /// Declared type name without namespace and `Collection(...)` wrapper.
    pub type_name: String,
    pub nullable: bool,
    pub max_length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub computed: bool,
    pub is_collection: bool,
}

#[derive(Clone, Debug)]
pub struct ReferentialConstraint {
    pub property: String,
    pub referenced_property: String,
}

#[derive(Clone, Debug)]
pub struct NavigationProperty {
    pub name: String,
    pub target_type: String,
    pub is_collection: bool,
    pub partner: Option<String>,
    pub contains_target: bool,
    pub referential_constraints: Vec<ReferentialConstraint>,
}

/// Recursive hierarchy declared on an entity type, with the output field names it writes.
#[derive(Clone, Debug)]
pub struct RecursiveHierarchy {
    pub qualifier: String,
    pub node_property: String,
    pub parent_navigation_property: String,
    /// Source property of the parent navigation's referential constraint.
    pub parent_property: String,
    pub distance_from_root_property: String,
    pub drill_state_property: String,
    pub limited_descendant_count_property: String,
    pub matched_property: String,
    pub matched_descendant_count_property: String,
}

#[derive(Clone, Debug)]
pub struct EntityType {
    pub name: String,
    pub keys: Vec<String>,
    pub properties: Vec<Property>,
    pub navigation_properties: Vec<NavigationProperty>,
    pub hierarchies: Vec<RecursiveHierarchy>,
    pub custom_aggregates: HashSet<String>,
}

impl EntityType {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn navigation(&self, name: &str) -> Option<&NavigationProperty> {
        self.navigation_properties.iter().find(|n| n.name == name)
    }

    pub fn hierarchy(&self, qualifier: &str) -> Option<&RecursiveHierarchy> {
        self.hierarchies.iter().find(|h| h.qualifier == qualifier)
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.keys.iter().any(|k| k == name)
    }

    /// Keys other than `IsActiveEntity`.
    pub fn business_keys(&self) -> impl Iterator<Item = &String> {
        self.keys.iter().filter(|k| k.as_str() != "IsActiveEntity")
    }

    pub fn string_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties
            .iter()
            .filter(|p| p.edm_type == EdmType::String && !p.is_collection)
    }
}

#[derive(Clone, Debug)]
pub struct ComplexType {
    pub name: String,
    pub properties: Vec<Property>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DraftRole {
    Root,
    Node,
}

#[derive(Clone, Debug)]
pub struct DraftSettings {
    pub role: DraftRole,
    pub activation_action: String,
    pub edit_action: String,
    pub prepare_action: String,
    pub discard_action: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct StickySettings {
    pub new_action: Option<String>,
    pub edit_action: Option<String>,
    pub save_action: Option<String>,
    pub discard_action: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EntitySetDef {
    pub name: String,
    pub entity_type: Arc<EntityType>,
    pub singleton: bool,
    pub parametrized: bool,
    pub navigation_bindings: HashMap<String, String>,
    pub draft: Option<DraftSettings>,
    pub sticky: Option<StickySettings>,
}

impl EntitySetDef {
    pub fn is_draft(&self) -> bool {
        self.draft.is_some()
    }

    pub fn is_draft_root(&self) -> bool {
        matches!(&self.draft, Some(d) if d.role == DraftRole::Root)
    }
}

#[derive(Clone, Debug)]
pub struct ActionParameter {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

#[derive(Clone, Debug)]
pub struct Action {
    pub name: String,
    pub is_bound: bool,
    pub binding_type: Option<String>,
    pub binding_is_collection: bool,
    pub is_function: bool,
    pub parameters: Vec<ActionParameter>,
    pub return_type: Option<String>,
    pub entity_set: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServiceSchema {
    pub namespace: String,
    pub version: ODataVersion,
    pub entity_types: HashMap<String, Arc<EntityType>>,
    pub complex_types: HashMap<String, Arc<ComplexType>>,
    pub entity_sets: Vec<Arc<EntitySetDef>>,
    pub entity_set_by_name: HashMap<String, Arc<EntitySetDef>>,
    pub actions: Vec<Action>,
}

impl ServiceSchema {
    pub fn entity_set(&self, name: &str) -> Option<&Arc<EntitySetDef>> {
        self.entity_set_by_name.get(name)
    }

    pub fn entity_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.entity_types.get(short_type_name(name))
    }

    pub fn complex_type(&self, name: &str) -> Option<&Arc<ComplexType>> {
        self.complex_types.get(short_type_name(name))
    }

    /// Action bound to `type_name`, trying the single-instance binding first and the collection binding second.
    pub fn bound_action(&self, type_name: &str, name: &str, prefer_collection: bool) -> Option<&Action> {
        let type_name = short_type_name(type_name);
        let matches = |collection: bool| {
            self.actions.iter().find(|a| {
                a.is_bound
                    && a.name == name
                    && a.binding_is_collection == collection
                    && a.binding_type.as_deref().map(short_type_name) == Some(type_name)
            })
        };
        if prefer_collection {
            matches(true).or_else(|| matches(false))
        } else {
            matches(false).or_else(|| matches(true))
        }
    }

    pub fn unbound_action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| !a.is_bound && a.name == name)
    }

    /// Entity set reached from `set` through navigation property `nav`: explicit binding first, else the only set of the target type.
    pub fn navigation_target(&self, set: &EntitySetDef, nav: &NavigationProperty) -> Option<&Arc<EntitySetDef>> {
        if let Some(target) = set.navigation_bindings.get(&nav.name) {
            return self.entity_set(target);
        }
        let target_type = short_type_name(&nav.target_type);
        let mut candidates = self
            .entity_sets
            .iter()
            .filter(|s| s.entity_type.name == target_type);
        let first = candidates.next();
        if candidates.next().is_some() {
            return None;
        }
        first
    }

    /// Property declared at a slash path, walking navigation and complex properties.
    pub fn property_at(&self, entity_type: &EntityType, path: &str) -> Option<Property> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let (last, prefix) = parts.split_last()?;
        let mut entity: Option<Arc<EntityType>> = None;
        let mut complex: Option<Arc<ComplexType>> = None;
        for part in prefix {
            if let Some(c) = &complex {
                let prop = c.properties.iter().find(|p| p.name == *part)?;
                let next = self.complex_type(&prop.type_name)?.clone();
                complex = Some(next);
                continue;
            }
            let current: &EntityType = entity.as_deref().unwrap_or(entity_type);
            if let Some(prop) = current.property(part) {
                let next = self.complex_type(&prop.type_name)?.clone();
                complex = Some(next);
            } else {
                let nav = current.navigation(part)?;
                let next = self.entity_type(&nav.target_type)?.clone();
                entity = Some(next);
            }
        }
        let properties = match &complex {
            Some(c) => &c.properties,
            None => &entity.as_deref().unwrap_or(entity_type).properties,
        };
        properties.iter().find(|p| p.name == *last).cloned()
    }

    /// Entity type reached through a slash-separated navigation path.
    pub fn navigation_type_at(&self, entity_type: &EntityType, path: &str) -> Option<Arc<EntityType>> {
        let mut current: Option<Arc<EntityType>> = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let nav = match &current {
                Some(t) => t.navigation(part)?.clone(),
                None => entity_type.navigation(part)?.clone(),
            };
            current = Some(self.entity_type(&nav.target_type)?.clone());
        }
        current
    }
}

/// Strip namespace qualification and a `Collection(...)` wrapper from a type name.
pub fn short_type_name(name: &str) -> &str {
    let inner = name
        .strip_prefix("Collection(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(name);
    if inner.starts_with("Edm.") {
        return inner;
    }
    inner.rsplit('.').next().unwrap_or(inner)
}
