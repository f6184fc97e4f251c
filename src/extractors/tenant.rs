//! Extract the tenant id from the request (`sap-client` query parameter or `X-Tenant-ID` header).

use crate::tenant::{resolve_tenant, sap_client_from_query, TENANT_ID_HEADER};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Resolved tenant id; never empty.
#[derive(Clone, Debug)]
pub struct TenantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(TENANT_ID_HEADER)
            .and_then(|v: &axum::http::HeaderValue| v.to_str().ok());
        let client = sap_client_from_query(parts.uri.query());
        Ok(TenantId(resolve_tenant(client.as_deref(), header)))
    }
}
