//! Tenant resolution. Every tenant gets its own copy of each entity collection.

/// Header carrying an explicit tenant id.
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";

/// Query parameter carrying the client number; mapped to `tenant-<client>`.
pub const SAP_CLIENT_PARAM: &str = "sap-client";

pub const DEFAULT_TENANT: &str = "tenant-default";

/// Tenant id for a request: `sap-client` wins over the header, both fall back to [`DEFAULT_TENANT`].
pub fn resolve_tenant(sap_client: Option<&str>, header: Option<&str>) -> String {
    if let Some(client) = sap_client.map(str::trim).filter(|c| !c.is_empty()) {
        return format!("tenant-{}", client);
    }
    header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_TENANT.to_string())
}

/// `sap-client` value from a raw query string, if present.
pub fn sap_client_from_query(raw_query: Option<&str>) -> Option<String> {
    raw_query?.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == SAP_CLIENT_PARAM).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_parameter_wins() {
        assert_eq!(resolve_tenant(Some("100"), Some("acme")), "tenant-100");
        assert_eq!(resolve_tenant(None, Some("acme")), "acme");
        assert_eq!(resolve_tenant(Some(" "), None), DEFAULT_TENANT);
    }

    #[test]
    fn client_read_from_query() {
        assert_eq!(sap_client_from_query(Some("$top=1&sap-client=200")), Some("200".into()));
        assert_eq!(sap_client_from_query(Some("$top=1")), None);
        assert_eq!(sap_client_from_query(None), None);
    }
}
