//! TOML configuration loading.
//!
//! The configuration file is read once at startup. Top-level tables the core
//! does not recognize are kept verbatim and handed opaquely to the notifier
//! whose namespace matches (see `notify::NotifierSet::discover`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::EewcastError;
use crate::models::Service;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Enables verbose logs, equivalent to `--verbose`.
    #[serde(rename = "debug-mode", default)]
    pub debug_mode: bool,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// Provider whitelist. Absent section means every provider is accepted.
    #[serde(default)]
    pub eew_source: ProviderFilter,

    /// Unrecognized top-level tables, keyed by notifier namespace.
    #[serde(flatten)]
    extra: toml::Table,
}

/// Logging options.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log retention window in days, consumed by the external log shipper.
    #[serde(default = "default_retention")]
    pub retention: u32,

    /// Log line format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            format: LogFormat::default(),
        }
    }
}

fn default_retention() -> u32 {
    30
}

/// Supported log line formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

/// Upstream API endpoints and assets.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Upstream DNS domain shared by all nodes.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Upstream API version (the `N` in `/api/vN`).
    #[serde(default = "default_api_version")]
    pub version: u8,

    /// Number of HTTP nodes (`api-1` .. `api-N`).
    #[serde(rename = "http-nodes", default = "default_http_nodes")]
    pub http_nodes: usize,

    /// Number of WebSocket nodes (`lb-1` .. `lb-M`).
    #[serde(rename = "ws-nodes", default = "default_ws_nodes")]
    pub ws_nodes: usize,

    /// Directory holding static assets such as `region.json`.
    #[serde(rename = "asset-dir", default = "default_asset_dir")]
    pub asset_dir: PathBuf,

    /// Services requested in the WebSocket subscribe frame.
    #[serde(default = "default_services")]
    pub services: Vec<Service>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            version: default_api_version(),
            http_nodes: default_http_nodes(),
            ws_nodes: default_ws_nodes(),
            asset_dir: default_asset_dir(),
            services: default_services(),
        }
    }
}

fn default_domain() -> String {
    "exptech.dev".to_string()
}

fn default_api_version() -> u8 {
    1
}

fn default_http_nodes() -> usize {
    2
}

fn default_ws_nodes() -> usize {
    4
}

fn default_asset_dir() -> PathBuf {
    PathBuf::from("asset")
}

fn default_services() -> Vec<Service> {
    vec![Service::Eew, Service::TremEew]
}

/// Which upstream providers are accepted before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderFilter {
    /// If true, accept every provider regardless of per-provider flags.
    #[serde(default)]
    pub all: bool,

    /// Per-provider whitelist flags, e.g. `cwa = true`.
    #[serde(flatten)]
    pub providers: BTreeMap<String, bool>,
}

impl Default for ProviderFilter {
    fn default() -> Self {
        // No `eew_source` section configured means no filtering at all.
        Self {
            all: true,
            providers: BTreeMap::new(),
        }
    }
}

impl ProviderFilter {
    /// Whether bulletins authored by `provider` pass the whitelist.
    #[must_use]
    pub fn allows(&self, provider: &str) -> bool {
        self.all || self.providers.get(provider).copied().unwrap_or(false)
    }
}

impl Config {
    /// Load and validate the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or structurally
    /// invalid. These are fatal at startup.
    pub fn load(path: &Path) -> Result<Self, EewcastError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EewcastError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn parse(raw: &str) -> Result<Self, EewcastError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| EewcastError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EewcastError> {
        if self.log.retention == 0 {
            return Err(EewcastError::Config(
                "log.retention must be a positive number of days".into(),
            ));
        }
        if self.api.http_nodes == 0 {
            return Err(EewcastError::Config(
                "api.http-nodes must be at least 1".into(),
            ));
        }
        if self.api.ws_nodes == 0 {
            return Err(EewcastError::Config("api.ws-nodes must be at least 1".into()));
        }
        Ok(())
    }

    /// The opaque config section for a notifier namespace, if present.
    #[must_use]
    pub fn section(&self, namespace: &str) -> Option<&toml::Table> {
        self.extra.get(namespace).and_then(toml::Value::as_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").expect("empty config should parse");
        assert!(!config.debug_mode);
        assert_eq!(config.log.retention, 30);
        assert_eq!(config.log.format, LogFormat::Full);
        assert_eq!(config.api.domain, "exptech.dev");
        assert_eq!(config.api.http_nodes, 2);
        assert_eq!(config.api.ws_nodes, 4);
        // Absent eew_source section disables filtering entirely.
        assert!(config.eew_source.allows("cwa"));
        assert!(config.eew_source.allows("trem"));
    }

    #[test]
    fn test_provider_whitelist() {
        let config = Config::parse(
            r#"
            [eew_source]
            cwa = true
            trem = false
            "#,
        )
        .expect("config should parse");

        assert!(config.eew_source.allows("cwa"));
        assert!(!config.eew_source.allows("trem"));
        assert!(!config.eew_source.allows("unknown"));
    }

    #[test]
    fn test_provider_accept_all() {
        let config = Config::parse("[eew_source]\nall = true\ntrem = false\n")
            .expect("config should parse");
        assert!(config.eew_source.allows("trem"));
    }

    #[test]
    fn test_notifier_section_passthrough() {
        let config = Config::parse(
            r#"
            debug-mode = true

            [webhook]
            url = "https://example.invalid/hook"
            "#,
        )
        .expect("config should parse");

        assert!(config.debug_mode);
        let section = config.section("webhook").expect("webhook section");
        assert_eq!(
            section.get("url").and_then(toml::Value::as_str),
            Some("https://example.invalid/hook")
        );
        assert!(config.section("absent").is_none());
    }

    #[test]
    fn test_invalid_retention_rejected() {
        assert!(Config::parse("[log]\nretention = 0\n").is_err());
    }

    #[test]
    fn test_log_format_parse() {
        let config =
            Config::parse("[log]\nformat = \"json\"\n").expect("config should parse");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_services_override() {
        let config = Config::parse("[api]\nservices = [\"websocket.eew\"]\n")
            .expect("config should parse");
        assert_eq!(config.api.services, vec![Service::Eew]);
    }
}
