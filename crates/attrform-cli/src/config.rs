//! CLI configuration.
//!
//! Loads settings from `ATTRFORM_*` environment variables with sensible
//! defaults. Command-line flags override them.

use std::time::Duration;

use attrform_transport::HttpTransportConfig;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Connector base URL callbacks are sent to.
    pub connector_url: String,
    /// Bearer token for the connector (optional).
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after the first attempt on 429/5xx and network errors.
    pub max_retries: u32,
    /// Log level filter (e.g., `warn`, `debug`), used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            connector_url: "http://127.0.0.1:8280".to_owned(),
            token: None,
            timeout_secs: 10,
            max_retries: 3,
            log_level: "warn".to_owned(),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ATTRFORM_CONNECTOR_URL`: connector base URL (default: `http://127.0.0.1:8280`)
    /// - `ATTRFORM_TOKEN`: bearer token (optional)
    /// - `ATTRFORM_TIMEOUT_SECS`: request timeout (default: `10`)
    /// - `ATTRFORM_MAX_RETRIES`: retry attempts (default: `3`)
    /// - `ATTRFORM_LOG_LEVEL`: log filter (default: `warn`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let connector_url = lookup("ATTRFORM_CONNECTOR_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.connector_url);

        let token = lookup("ATTRFORM_TOKEN").filter(|v| !v.is_empty());

        let timeout_secs = lookup("ATTRFORM_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.timeout_secs);

        let max_retries = lookup("ATTRFORM_MAX_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries);

        let log_level = lookup("ATTRFORM_LOG_LEVEL").unwrap_or(defaults.log_level);

        Self {
            connector_url,
            token,
            timeout_secs,
            max_retries,
            log_level,
        }
    }

    /// Settings for the HTTP callback transport.
    #[must_use]
    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: self.connector_url.clone(),
            token: self.token.clone().unwrap_or_default(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
        }
    }
}
