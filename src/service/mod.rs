//! Mock service runtime: entity sets, query execution, draft and sticky lifecycles.

mod aggregate;
mod contained;
mod context;
mod contributor;
mod data_access;
mod draft;
mod entity_set;
mod evaluator;
mod hierarchy;
mod navigation;
mod registry;
mod sticky;
mod transform;

pub use contained::ContainedEntitySet;
pub use context::RequestContext;
pub use contributor::{ContributorContext, DefaultContributor, MockDataContributor};
pub use data_access::{key_predicate, DataAccess, DataAccessBuilder, ODataResult};
pub use draft::{HAS_ACTIVE_ENTITY, HAS_DRAFT_ENTITY};
pub use entity_set::{coerce_value, EntitySets, MockEntitySet, SetVariant};
pub use evaluator::{evaluate, matches_search, EvalContext};
pub use navigation::{target_keys, KeySource, DRAFT_ADMINISTRATIVE_DATA, IS_ACTIVE_ENTITY, SIBLING_ENTITY};
pub use registry::ServiceRegistry;
pub use sticky::{StickySessions, SESSION_TIMEOUT_HEADER, TRANSIENT_FLAG};
