// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Service label and annotation keys understood by dnsync.
//!
//! The management, hostname and rule keys are configurable; the values here are the
//! defaults the configuration layer falls back to.

// ============================================================================
// Management Labels
// ============================================================================

/// Label that opts a service into DNS management; its value must be `"true"`
pub const DEFAULT_MANAGED_LABEL: &str = "dns.managed";

/// Value of the management label that enables management
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Label listing hostnames explicitly, overriding rule extraction
pub const DEFAULT_HOSTNAME_LABEL: &str = "dns.hostname";

/// Label overriding the catalog category derived from the service name
pub const CATEGORY_LABEL: &str = "dns.category";

/// Label carrying a free-text catalog description
pub const DESCRIPTION_LABEL: &str = "dns.description";

// ============================================================================
// Traefik Router Rules
// ============================================================================

/// Prefix of Traefik HTTP router keys (`traefik.http.routers.<router>.rule`)
pub const DEFAULT_ROUTER_PREFIX: &str = "traefik.http.routers.";

/// Suffix of Traefik HTTP router rule keys
pub const ROUTER_RULE_SUFFIX: &str = ".rule";

/// Return the router name if `key` is a router rule key under `prefix`.
///
/// `traefik.http.routers.web.rule` yields `Some("web")`; any other key yields `None`.
#[must_use]
pub fn router_name<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let router = key.strip_prefix(prefix)?.strip_suffix(ROUTER_RULE_SUFFIX)?;
    if router.is_empty() || router.contains('.') {
        return None;
    }
    Some(router)
}
