//! Raw service description types matching the JSON schema handed over by the metadata converter.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    /// `Edm.*` primitive name or the name of a complex type.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    /// Core.Computed: the server fills the value, empty rows leave it null.
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub is_collection: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferentialConstraintConfig {
    /// Property on the source (declaring) entity type.
    pub property: String,
    /// Property on the target entity type.
    pub referenced_property: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationPropertyConfig {
    pub name: String,
    pub target_type: String,
    #[serde(default)]
    pub is_collection: bool,
    #[serde(default)]
    pub partner: Option<String>,
    #[serde(default)]
    pub contains_target: bool,
    #[serde(default)]
    pub referential_constraints: Vec<ReferentialConstraintConfig>,
}

/// Aggregation.RecursiveHierarchy plus the Hierarchy.RecursiveHierarchy output fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub qualifier: String,
    pub node_property: String,
    pub parent_navigation_property: String,
    #[serde(default)]
    pub distance_from_root_property: Option<String>,
    #[serde(default)]
    pub drill_state_property: Option<String>,
    #[serde(default)]
    pub limited_descendant_count_property: Option<String>,
    #[serde(default)]
    pub matched_property: Option<String>,
    #[serde(default)]
    pub matched_descendant_count_property: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityTypeConfig {
    pub name: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
    #[serde(default)]
    pub navigation_properties: Vec<NavigationPropertyConfig>,
    #[serde(default)]
    pub hierarchies: Vec<HierarchyConfig>,
    #[serde(default)]
    pub custom_aggregates: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplexTypeConfig {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

/// Draft capability marker. Absent on non-draft entity sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DraftConfig {
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub node: bool,
    #[serde(default = "default_activation_action")]
    pub activation_action: String,
    #[serde(default = "default_edit_action")]
    pub edit_action: String,
    #[serde(default = "default_prepare_action")]
    pub prepare_action: String,
    #[serde(default)]
    pub discard_action: Option<String>,
}

fn default_activation_action() -> String {
    "draftActivate".into()
}

fn default_edit_action() -> String {
    "draftEdit".into()
}

fn default_prepare_action() -> String {
    "draftPrepare".into()
}

/// Session.StickySessionSupported action names.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StickyConfig {
    #[serde(default)]
    pub new_action: Option<String>,
    #[serde(default)]
    pub edit_action: Option<String>,
    #[serde(default)]
    pub save_action: Option<String>,
    #[serde(default)]
    pub discard_action: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntitySetConfig {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub parametrized: bool,
    #[serde(default)]
    pub navigation_bindings: HashMap<String, String>,
    #[serde(default)]
    pub draft: Option<DraftConfig>,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionParameterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    #[serde(default)]
    pub is_bound: bool,
    #[serde(default)]
    pub binding_type: Option<String>,
    #[serde(default)]
    pub binding_is_collection: bool,
    #[serde(default)]
    pub is_function: bool,
    #[serde(default)]
    pub parameters: Vec<ActionParameterConfig>,
    #[serde(default)]
    pub return_type: Option<String>,
    /// Entity set the action returns or operates on (function imports, `EntitySetPath`).
    #[serde(default)]
    pub entity_set: Option<String>,
}

/// Protocol dialect of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ODataVersion {
    V2,
    V4,
}

impl<'de> Deserialize<'de> for ODataVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match &v {
            serde_json::Value::String(s) if s.starts_with('2') => Ok(ODataVersion::V2),
            serde_json::Value::String(s) if s.starts_with('4') => Ok(ODataVersion::V4),
            serde_json::Value::Number(n) if n.as_f64().map(|f| f < 3.0).unwrap_or(false) => Ok(ODataVersion::V2),
            serde_json::Value::Number(_) => Ok(ODataVersion::V4),
            other => Err(serde::de::Error::custom(format!(
                "service version must be \"2.0\" or \"4.0\"; got {}",
                other
            ))),
        }
    }
}

impl Default for ODataVersion {
    fn default() -> Self {
        ODataVersion::V4
    }
}

/// The whole service description in one struct.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: ODataVersion,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeConfig>,
    #[serde(default)]
    pub complex_types: Vec<ComplexTypeConfig>,
    #[serde(default)]
    pub entity_sets: Vec<EntitySetConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}
