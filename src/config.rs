// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Static configuration loaded once at startup.
//!
//! The configuration file is YAML. Every section carries serde defaults except the
//! directory connection settings and the load-balancer addresses, which have no
//! sensible default. [`Config::load`] parses and validates; any problem is a
//! [`ConfigError`] and the process does not start.
//!
//! ```yaml
//! directory:
//!   server: ipa.example.com
//!   zone: example.com
//!   username: dns-automation
//!   password_file: /run/secrets/ipa-password
//! load_balancer_addresses: ["10.0.0.10", "10.0.0.11"]
//! certificates:
//!   enabled: true
//! ```

use crate::constants::{
    DEFAULT_CATALOG_BIND_ADDRESS, DEFAULT_CATALOG_TITLE, DEFAULT_CERT_DIR,
    DEFAULT_CERT_VALIDITY_DAYS, DEFAULT_DIRECTORY_TIMEOUT_SECS, DEFAULT_HOSTNAME_DELIMITER,
    DEFAULT_MANUAL_CATEGORY, DEFAULT_MIN_TLS_VERSION, DEFAULT_ORCHESTRATOR_TIMEOUT_SECS,
    DEFAULT_PROXY_CONFIG_FILE, DEFAULT_RENEW_THRESHOLD_DAYS, DEFAULT_RESYNC_INTERVAL_SECS,
    DEFAULT_RETRY_INITIAL_INTERVAL_MILLIS, DEFAULT_RETRY_MAX_ATTEMPTS,
    DEFAULT_RETRY_MAX_INTERVAL_SECS, DEFAULT_RETRY_MULTIPLIER,
    DEFAULT_RETRY_RANDOMIZATION_FACTOR, ENV_DIRECTORY_PASSWORD, MAX_SWEEP_INTERVAL_SECS,
    MIN_SWEEP_INTERVAL_SECS, SWEEPS_PER_RENEW_THRESHOLD,
};
use crate::labels::{DEFAULT_HOSTNAME_LABEL, DEFAULT_MANAGED_LABEL, DEFAULT_ROUTER_PREFIX};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`Config`]
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        /// Path that was parsed
        path: PathBuf,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// A field holds a value the system cannot run with
    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Root of the YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory service (FreeIPA) connection
    pub directory: DirectoryConfig,

    /// Addresses published as DNS targets for every managed hostname
    #[serde(default)]
    pub load_balancer_addresses: Vec<IpAddr>,

    /// Orchestrator watch and hostname extraction settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Certificate automation
    #[serde(default)]
    pub certificates: CertificateConfig,

    /// Retry policy for directory calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Read-only service catalog
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Directory service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Server host name or base URL (`ipa.example.com` or `https://ipa.example.com`)
    pub server: String,

    /// DNS zone all managed hostnames live in
    pub zone: String,

    /// Principal used to authenticate
    pub username: String,

    /// Inline password (prefer `password_file` or the environment)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// File holding the password
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[serde(default = "default_directory_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Verify the server's TLS certificate
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// Where DNS target addresses come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    /// `load_balancer_addresses` from configuration
    #[default]
    Configured,
    /// The service's own load-balancer ingress addresses
    Service,
}

/// Orchestrator watch and hostname extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,

    /// Label that must be `"true"` for a service to be managed
    pub managed_label: String,

    /// Label listing hostnames explicitly
    pub hostname_label: String,

    /// Delimiter between hostnames in `hostname_label`
    pub hostname_delimiter: String,

    /// Scan router rules for `Host(...)` predicates
    pub extract_from_rules: bool,

    /// Key prefix of router rule entries
    pub router_prefix: String,

    /// Source of DNS target addresses
    pub address_source: AddressSource,

    /// Seconds between full-inventory resyncs
    pub resync_interval_secs: u64,

    /// Timeout in seconds for orchestrator list calls
    pub api_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            managed_label: DEFAULT_MANAGED_LABEL.to_string(),
            hostname_label: DEFAULT_HOSTNAME_LABEL.to_string(),
            hostname_delimiter: DEFAULT_HOSTNAME_DELIMITER.to_string(),
            extract_from_rules: true,
            router_prefix: DEFAULT_ROUTER_PREFIX.to_string(),
            address_source: AddressSource::Configured,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            api_timeout_secs: DEFAULT_ORCHESTRATOR_TIMEOUT_SECS,
        }
    }
}

/// Certificate automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Request certificates for managed hostnames
    pub enabled: bool,

    /// Requested validity in days
    pub validity_days: u32,

    /// Reissue when this many days or fewer remain
    pub renew_threshold_days: u32,

    /// Override for the periodic sweep interval
    pub sweep_interval_secs: Option<u64>,

    /// Directory holding `<hostname>.crt` / `<hostname>.key`
    pub cert_dir: PathBuf,

    /// Proxy dynamic-configuration file
    pub proxy_config_file: PathBuf,

    /// `minVersion` of the proxy's default TLS options
    pub min_tls_version: String,

    /// `sniStrict` of the proxy's default TLS options
    pub sni_strict: bool,

    /// Organization (`O=`) placed in certificate requests
    pub organization: Option<String>,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            validity_days: DEFAULT_CERT_VALIDITY_DAYS,
            renew_threshold_days: DEFAULT_RENEW_THRESHOLD_DAYS,
            sweep_interval_secs: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            proxy_config_file: PathBuf::from(DEFAULT_PROXY_CONFIG_FILE),
            min_tls_version: DEFAULT_MIN_TLS_VERSION.to_string(),
            sni_strict: false,
            organization: None,
        }
    }
}

impl CertificateConfig {
    /// Renew threshold as a chrono duration.
    #[must_use]
    pub fn renew_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renew_threshold_days))
    }

    /// Interval of the periodic certificate sweep.
    ///
    /// A fraction of the renew threshold, clamped to `[1 minute, 1 day]`, unless
    /// overridden.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        if let Some(secs) = self.sweep_interval_secs {
            return Duration::from_secs(secs.max(1));
        }
        let threshold_secs = u64::from(self.renew_threshold_days) * 86_400;
        let secs = threshold_secs / u64::from(SWEEPS_PER_RENEW_THRESHOLD);
        Duration::from_secs(secs.clamp(MIN_SWEEP_INTERVAL_SECS, MAX_SWEEP_INTERVAL_SECS))
    }
}

/// Retry policy settings for directory calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per task, first attempt included
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    pub initial_interval_millis: u64,
    /// Cap on a single backoff delay in seconds
    pub max_interval_secs: u64,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Jitter factor (0.1 = ±10%)
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_interval_millis: DEFAULT_RETRY_INITIAL_INTERVAL_MILLIS,
            max_interval_secs: DEFAULT_RETRY_MAX_INTERVAL_SECS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            randomization_factor: DEFAULT_RETRY_RANDOMIZATION_FACTOR,
        }
    }
}

/// Catalog web UI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Serve the catalog
    pub enabled: bool,
    /// Listen address
    pub bind_address: String,
    /// Page title
    pub title: String,
    /// Subtitle under the page title
    pub description: String,
    /// Entries not discovered from the orchestrator
    pub manual_services: Vec<ManualService>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: DEFAULT_CATALOG_BIND_ADDRESS.to_string(),
            title: DEFAULT_CATALOG_TITLE.to_string(),
            description: String::new(),
            manual_services: Vec::new(),
        }
    }
}

/// A catalog entry declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualService {
    /// Display name
    pub name: String,
    /// Link target
    pub url: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Catalog category
    #[serde(default = "default_manual_category")]
    pub category: String,
}

fn default_directory_timeout_secs() -> u64 {
    DEFAULT_DIRECTORY_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_manual_category() -> String {
    DEFAULT_MANUAL_CATEGORY.to_string()
}

impl Config {
    /// Read, parse and validate the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.resolve_password(std::env::var(ENV_DIRECTORY_PASSWORD).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without validating it.
    ///
    /// # Errors
    ///
    /// Returns the YAML error if the document does not match [`Config`].
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Settle the directory password: environment first, then file, then inline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if `password_file` is set but unreadable.
    pub fn resolve_password(&mut self, from_env: Option<String>) -> Result<(), ConfigError> {
        if let Some(password) = from_env.filter(|p| !p.is_empty()) {
            self.directory.password = Some(password);
            return Ok(());
        }
        if self.directory.password.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.directory.password_file {
            let password = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            self.directory.password = Some(password.trim_end().to_string());
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.server.trim().is_empty() {
            return Err(invalid("directory.server", "must not be empty"));
        }
        if self.directory.zone.trim().trim_end_matches('.').is_empty() {
            return Err(invalid("directory.zone", "must not be empty"));
        }
        if self.directory.username.trim().is_empty() {
            return Err(invalid("directory.username", "must not be empty"));
        }
        if self.directory.password.as_deref().is_none_or(str::is_empty) {
            return Err(invalid(
                "directory.password",
                format!("set directory.password, directory.password_file or {ENV_DIRECTORY_PASSWORD}"),
            ));
        }
        if self.directory.request_timeout_secs == 0 {
            return Err(invalid("directory.request_timeout_secs", "must be positive"));
        }
        if self.orchestrator.address_source == AddressSource::Configured
            && self.load_balancer_addresses.is_empty()
        {
            return Err(invalid(
                "load_balancer_addresses",
                "at least one address is required when address_source is 'configured'",
            ));
        }
        if self.orchestrator.managed_label.is_empty() {
            return Err(invalid("orchestrator.managed_label", "must not be empty"));
        }
        if self.orchestrator.hostname_delimiter.is_empty() {
            return Err(invalid("orchestrator.hostname_delimiter", "must not be empty"));
        }
        if self.orchestrator.resync_interval_secs == 0 {
            return Err(invalid("orchestrator.resync_interval_secs", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if !(0.0..1.0).contains(&self.retry.randomization_factor) {
            return Err(invalid("retry.randomization_factor", "must be in [0, 1)"));
        }
        if self.certificates.renew_threshold_days >= self.certificates.validity_days {
            return Err(invalid(
                "certificates.renew_threshold_days",
                format!(
                    "{} must be below validity_days ({})",
                    self.certificates.renew_threshold_days, self.certificates.validity_days
                ),
            ));
        }
        if self.catalog.enabled && self.catalog.bind_address.parse::<SocketAddr>().is_err() {
            return Err(invalid(
                "catalog.bind_address",
                format!("'{}' is not a socket address", self.catalog.bind_address),
            ));
        }
        Ok(())
    }

    /// The zone normalized to lowercase without a trailing dot.
    #[must_use]
    pub fn zone(&self) -> String {
        self.directory.zone.trim().trim_end_matches('.').to_ascii_lowercase()
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
