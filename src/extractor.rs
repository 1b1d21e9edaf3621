// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Hostname extraction from service metadata.
//!
//! [`extract`] is the only place that looks at raw label strings. It turns a service's
//! metadata into a set of canonical, fully-qualified hostnames inside the managed zone:
//!
//! 1. A service without `<managed_label>=true` owns nothing.
//! 2. If the explicit hostname label is present, its delimited values are the whole
//!    result. Relative names are qualified with the zone.
//! 3. Otherwise, when rule extraction is enabled, every `traefik.http.routers.<r>.rule`
//!    entry is scanned for `Host(...)` predicates and the union of all host literals is
//!    the result.
//!
//! Problems with individual rules or names never fail the whole service; they are
//! returned as [`ExtractionWarning`]s next to whatever could be extracted.

use crate::config::Config;
use crate::labels::{router_name, MANAGED_LABEL_VALUE};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Merged labels and annotations of a service.
pub type ServiceMetadata = BTreeMap<String, String>;

/// Maximum length of a fully-qualified hostname
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Predicate name scanned for in router rules
const HOST_PREDICATE: &str = "Host(";

/// Recoverable problems found while extracting hostnames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionWarning {
    /// A router rule could not be parsed; it contributes no hostnames
    #[error("malformed rule for router '{router}': {reason} (rule: {rule})")]
    MalformedRule {
        /// Router the rule belongs to
        router: String,
        /// The raw rule text
        rule: String,
        /// What the parser tripped over
        reason: String,
    },

    /// A rule names a host outside the managed zone
    #[error("host '{hostname}' from router '{router}' is outside zone '{zone}'")]
    OutsideZone {
        /// Router the host came from
        router: String,
        /// The host literal
        hostname: String,
        /// The managed zone
        zone: String,
    },

    /// A name is not a valid DNS hostname
    #[error("invalid hostname '{hostname}': {reason}")]
    InvalidHostname {
        /// The rejected name
        hostname: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Result of [`extract`]: the claimed hostnames plus any warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Canonical FQDNs (lowercase, no trailing dot)
    pub hostnames: BTreeSet<String>,
    /// Recoverable problems encountered on the way
    pub warnings: Vec<ExtractionWarning>,
}

/// Extraction settings, projected from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorSettings {
    /// Label that must be `"true"`
    pub managed_label: String,
    /// Explicit hostname label
    pub hostname_label: String,
    /// Delimiter inside the hostname label
    pub hostname_delimiter: String,
    /// Scan router rules
    pub extract_from_rules: bool,
    /// Router key prefix
    pub router_prefix: String,
    /// Managed zone, lowercase without trailing dot
    pub zone: String,
}

impl ExtractorSettings {
    /// Build settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            managed_label: config.orchestrator.managed_label.clone(),
            hostname_label: config.orchestrator.hostname_label.clone(),
            hostname_delimiter: config.orchestrator.hostname_delimiter.clone(),
            extract_from_rules: config.orchestrator.extract_from_rules,
            router_prefix: config.orchestrator.router_prefix.clone(),
            zone: config.zone(),
        }
    }
}

/// Whether the service carries the management label.
#[must_use]
pub fn is_managed(settings: &ExtractorSettings, metadata: &ServiceMetadata) -> bool {
    metadata
        .get(&settings.managed_label)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(MANAGED_LABEL_VALUE))
}

/// Derive the hostnames a service claims from its metadata.
#[must_use]
pub fn extract(settings: &ExtractorSettings, metadata: &ServiceMetadata) -> Extraction {
    let mut extraction = Extraction::default();

    if !is_managed(settings, metadata) {
        return extraction;
    }

    if let Some(value) = metadata.get(&settings.hostname_label) {
        for raw in value.split(settings.hostname_delimiter.as_str()) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let fqdn = qualify(raw, &settings.zone);
            match validate_hostname(&fqdn) {
                Ok(()) => {
                    extraction.hostnames.insert(fqdn);
                }
                Err(reason) => extraction
                    .warnings
                    .push(ExtractionWarning::InvalidHostname { hostname: fqdn, reason }),
            }
        }
        return extraction;
    }

    if !settings.extract_from_rules {
        return extraction;
    }

    for (key, rule) in metadata {
        let Some(router) = router_name(key, &settings.router_prefix) else {
            continue;
        };
        let hosts = match parse_host_rule(rule) {
            Ok(hosts) => hosts,
            Err(reason) => {
                extraction.warnings.push(ExtractionWarning::MalformedRule {
                    router: router.to_string(),
                    rule: rule.clone(),
                    reason,
                });
                continue;
            }
        };
        for host in hosts {
            let fqdn = canonicalize(&host);
            if !in_zone(&fqdn, &settings.zone) {
                extraction.warnings.push(ExtractionWarning::OutsideZone {
                    router: router.to_string(),
                    hostname: fqdn,
                    zone: settings.zone.clone(),
                });
                continue;
            }
            match validate_hostname(&fqdn) {
                Ok(()) => {
                    extraction.hostnames.insert(fqdn);
                }
                Err(reason) => extraction
                    .warnings
                    .push(ExtractionWarning::InvalidHostname { hostname: fqdn, reason }),
            }
        }
    }

    extraction
}

/// Return every host literal named by `Host(...)` predicates in a router rule.
///
/// Accepts backtick- or double-quoted literals and multiple literals per predicate
/// (`Host(`a.x`, `b.x`)`). `HostRegexp`/`HostSNI` are different predicates and are not
/// matched. A rule with no `Host(` predicate yields an empty list.
///
/// # Errors
///
/// Returns a description of the problem when the rule is syntactically broken:
/// unbalanced parentheses, an unterminated or empty literal, or a predicate with
/// no literals.
pub fn parse_host_rule(rule: &str) -> Result<Vec<String>, String> {
    check_balanced(rule)?;

    let mut hosts = Vec::new();
    let mut search_from = 0;
    while let Some(offset) = rule[search_from..].find(HOST_PREDICATE) {
        let start = search_from + offset;
        let args_start = start + HOST_PREDICATE.len();
        let preceded_by_ident = rule[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if preceded_by_ident {
            search_from = args_start;
            continue;
        }
        let (literals, consumed) = parse_literals(&rule[args_start..])?;
        hosts.extend(literals);
        search_from = args_start + consumed;
    }
    Ok(hosts)
}

/// Parse `` `a`, "b") `` and return the literals plus the number of bytes consumed
/// (including the closing parenthesis).
fn parse_literals(input: &str) -> Result<(Vec<String>, usize), String> {
    let mut literals = Vec::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((quote_at, quote)) = chars.next() else {
            return Err("unexpected end of rule inside Host(...)".to_string());
        };
        if quote == ')' && literals.is_empty() {
            return Err("Host() has no hostname".to_string());
        }
        if quote != '`' && quote != '"' {
            return Err(format!("expected quoted hostname, found '{quote}'"));
        }

        let body_start = quote_at + quote.len_utf8();
        let Some(close) = input[body_start..].find(quote) else {
            return Err("unterminated hostname literal".to_string());
        };
        let literal = input[body_start..body_start + close].trim();
        if literal.is_empty() {
            return Err("empty hostname literal".to_string());
        }
        literals.push(literal.to_string());

        let after_literal = body_start + close + quote.len_utf8();
        while chars.next_if(|(i, _)| *i < after_literal).is_some() {}
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        match chars.next() {
            Some((_, ',')) => continue,
            Some((i, ')')) => return Ok((literals, i + 1)),
            Some((_, other)) => {
                return Err(format!("expected ',' or ')' after hostname, found '{other}'"))
            }
            None => return Err("missing ')' after Host(...)".to_string()),
        }
    }
}

/// Reject rules whose parentheses (outside quoted literals) do not balance.
fn check_balanced(rule: &str) -> Result<(), String> {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    for c in rule.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '`' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced ')'".to_string());
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated hostname literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    Ok(())
}

/// Lowercase and strip a trailing dot.
#[must_use]
pub fn canonicalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `fqdn` is the zone apex or a name below it.
#[must_use]
pub fn in_zone(fqdn: &str, zone: &str) -> bool {
    fqdn == zone
        || fqdn
            .strip_suffix(zone)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Qualify a label value with the zone unless it already sits inside it.
fn qualify(raw: &str, zone: &str) -> String {
    let name = canonicalize(raw);
    if in_zone(&name, zone) {
        name
    } else {
        format!("{name}.{zone}")
    }
}

/// Validate hostname syntax (RFC 1123 labels).
///
/// # Errors
///
/// Returns the reason the name is not a valid hostname.
pub fn validate_hostname(fqdn: &str) -> Result<(), String> {
    if fqdn.is_empty() {
        return Err("empty hostname".to_string());
    }
    if fqdn.len() > MAX_HOSTNAME_LEN {
        return Err(format!("longer than {MAX_HOSTNAME_LEN} characters"));
    }
    for label in fqdn.split('.') {
        if label.is_empty() {
            return Err("empty label".to_string());
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!("label '{label}' longer than {MAX_LABEL_LEN} characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{label}' starts or ends with '-'"));
        }
        if let Some(bad) = label
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(format!("label '{label}' contains '{bad}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "extractor_tests.rs"]
mod extractor_tests;
