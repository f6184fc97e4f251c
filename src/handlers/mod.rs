//! HTTP handlers for the mock OData services.

pub mod odata;
pub use odata::*;
