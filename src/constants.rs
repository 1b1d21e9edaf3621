// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for dnsync.
//!
//! Defaults used by the configuration layer and the engine, grouped by concern.

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Default path of the YAML configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yml";

/// Environment variable that overrides `directory.password`
pub const ENV_DIRECTORY_PASSWORD: &str = "DNSYNC_DIRECTORY_PASSWORD";

/// Default delimiter between hostnames in the explicit hostname label
pub const DEFAULT_HOSTNAME_DELIMITER: &str = ",";

// ============================================================================
// Directory Service Defaults
// ============================================================================

/// Timeout applied to every directory-service request
pub const DEFAULT_DIRECTORY_TIMEOUT_SECS: u64 = 30;

/// Upper bound on one directory operation, as a multiple of the request timeout.
///
/// An operation spans several requests (login, read, writes), so the guard is wider
/// than a single request.
pub const OPERATION_TIMEOUT_FACTOR: u32 = 8;

/// FreeIPA JSON-RPC API version sent with every call
pub const FREEIPA_API_VERSION: &str = "2.251";

/// Service principal prefix used for proxy TLS certificates
pub const CERTIFICATE_PRINCIPAL_PREFIX: &str = "HTTP";

// ============================================================================
// Orchestrator Defaults
// ============================================================================

/// Interval between full-inventory resyncs
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Timeout for orchestrator list calls
pub const DEFAULT_ORCHESTRATOR_TIMEOUT_SECS: u64 = 30;

/// Capacity of the channel feeding the engine loop
pub const ENGINE_INPUT_CHANNEL_CAPACITY: usize = 256;

/// How long the engine may spend finishing in-flight tasks at shutdown
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Tokio worker threads
pub const RUNTIME_WORKER_THREADS: usize = 4;

// ============================================================================
// Certificate Defaults
// ============================================================================

/// Default requested certificate validity
pub const DEFAULT_CERT_VALIDITY_DAYS: u32 = 730;

/// Default renewal threshold before expiry
pub const DEFAULT_RENEW_THRESHOLD_DAYS: u32 = 30;

/// Default directory holding certificate and key files
pub const DEFAULT_CERT_DIR: &str = "/certs/services";

/// Default path of the proxy dynamic-configuration artifact
pub const DEFAULT_PROXY_CONFIG_FILE: &str = "/traefik-config/certificates.yml";

/// Default minimum TLS version advertised to the proxy
pub const DEFAULT_MIN_TLS_VERSION: &str = "VersionTLS12";

/// The sweep runs this many times per renew threshold
pub const SWEEPS_PER_RENEW_THRESHOLD: u32 = 30;

/// Lower bound on the certificate sweep interval
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 60;

/// Upper bound on the certificate sweep interval (one day)
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 86_400;

// ============================================================================
// Retry Defaults
// ============================================================================

/// Attempts per task before a hostname is marked `Failed`
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// First retry delay
pub const DEFAULT_RETRY_INITIAL_INTERVAL_MILLIS: u64 = 500;

/// Upper bound on a single retry delay
pub const DEFAULT_RETRY_MAX_INTERVAL_SECS: u64 = 60;

/// Backoff growth factor
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Jitter applied to every delay (±10%)
pub const DEFAULT_RETRY_RANDOMIZATION_FACTOR: f64 = 0.1;

// ============================================================================
// Catalog Defaults
// ============================================================================

/// Default catalog listen address
pub const DEFAULT_CATALOG_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default catalog page title
pub const DEFAULT_CATALOG_TITLE: &str = "Service Catalog";

/// Category used for manual catalog entries without one
pub const DEFAULT_MANUAL_CATEGORY: &str = "Other";

// ============================================================================
// Metrics
// ============================================================================

/// Namespace prefix for all dnsync metrics
pub const METRICS_NAMESPACE: &str = "dnsync";
