//! Runtime settings for the mock server. Read from env (optionally seeded from `.env`).

use crate::error::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct MockServerSettings {
    /// URL prefix the service is mounted under, e.g. `/sap/opu/odata4/sap/svc`.
    pub service_path: String,
    /// JSON service description.
    pub service_config: Option<PathBuf>,
    /// Raw `$metadata` document served verbatim when present.
    pub metadata_document: Option<PathBuf>,
    /// Directory with `<EntitySet>.json` seed files.
    pub mock_data_dir: Option<PathBuf>,
    pub generate_mock_data: bool,
    /// When on, navigation without referential constraints resolves nothing instead of borrowing caller keys.
    pub strict_key_mode: bool,
    pub sticky_session_timeout: Duration,
    pub sweep_interval: Duration,
    pub default_user: String,
    pub bind_addr: String,
}

impl Default for MockServerSettings {
    fn default() -> Self {
        MockServerSettings {
            service_path: "/odata".into(),
            service_config: None,
            metadata_document: None,
            mock_data_dir: None,
            generate_mock_data: true,
            strict_key_mode: false,
            sticky_session_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            default_user: "anonymous".into(),
            bind_addr: "127.0.0.1:3000".into(),
        }
    }
}

impl MockServerSettings {
    /// Settings from `ODATA_*` environment variables; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut s = MockServerSettings::default();
        if let Some(path) = env_var("ODATA_SERVICE_PATH") {
            s.service_path = normalize_service_path(&path);
        }
        s.service_config = env_var("ODATA_SERVICE_CONFIG").map(PathBuf::from);
        s.metadata_document = env_var("ODATA_METADATA_DOCUMENT").map(PathBuf::from);
        s.mock_data_dir = env_var("ODATA_MOCKDATA_DIR").map(PathBuf::from);
        if let Some(v) = env_var("ODATA_GENERATE_MOCK_DATA") {
            s.generate_mock_data = parse_bool("ODATA_GENERATE_MOCK_DATA", &v)?;
        }
        if let Some(v) = env_var("ODATA_STRICT_KEY_MODE") {
            s.strict_key_mode = parse_bool("ODATA_STRICT_KEY_MODE", &v)?;
        }
        if let Some(v) = env_var("ODATA_STICKY_TIMEOUT_SECS") {
            s.sticky_session_timeout = Duration::from_secs(parse_num("ODATA_STICKY_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = env_var("ODATA_SWEEP_INTERVAL_SECS") {
            s.sweep_interval = Duration::from_secs(parse_num("ODATA_SWEEP_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = env_var("ODATA_DEFAULT_USER") {
            s.default_user = v;
        }
        if let Some(v) = env_var("ODATA_BIND_ADDR") {
            s.bind_addr = v;
        }
        Ok(s)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Settings(format!("{} must be a boolean, got {}", name, value))),
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Settings(format!("{} must be a number, got {}", name, value)))
}

/// Leading slash, no trailing slash.
pub fn normalize_service_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_path_is_normalized() {
        assert_eq!(normalize_service_path("odata/v4/"), "/odata/v4");
        assert_eq!(normalize_service_path("/sap/opu"), "/sap/opu");
    }

    #[test]
    fn bool_values_accept_common_spellings() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
