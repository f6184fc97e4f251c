//! OData mock server: schema-driven V2/V4 services over an in-memory, per-tenant entity store.

pub mod config;
pub mod error;
pub mod extractors;
pub mod files;
pub mod handlers;
pub mod query;
pub mod response;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;
pub mod tenant;

pub use config::{load_schema, resolve, MockServerSettings, ODataVersion, ServiceConfig, ServiceSchema};
pub use error::{AppError, ConfigError, ExecutionError};
pub use files::{FileLoader, FsFileLoader, MemoryFileLoader};
pub use query::ODataRequest;
pub use routes::{app, common_routes, odata_routes};
pub use service::{
    ContributorContext, DataAccess, DataAccessBuilder, DefaultContributor, MockDataContributor, ODataResult,
    RequestContext, ServiceRegistry,
};
pub use state::AppState;
pub use store::{EntityStore, KeyMap, Record};
