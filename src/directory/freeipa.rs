// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! FreeIPA directory client over the JSON-RPC API.
//!
//! All calls go to `POST <server>/ipa/session/json` with a session cookie obtained from
//! `POST <server>/ipa/session/login_password`. An expired session (HTTP 401) triggers
//! one transparent re-login.
//!
//! # Error Mapping
//!
//! | Condition | Class |
//! |-----------|-------|
//! | request timeout | retryable |
//! | connection failure | retryable |
//! | HTTP 429 / 5xx | retryable |
//! | RPC 903 (internal) / 907 (network) | retryable |
//! | HTTP 401 after re-login, RPC 1xxx | permanent (authentication) |
//! | RPC 3xxx (validation) | permanent (invalid hostname) |
//! | any other RPC error | permanent (rejected) |

use super::{
    csr, CertResult, CertStatusResult, CertificateInfo, CertificateMaterial, DirectoryClient,
    IssuedCertificate, RecordChange, RecordResult,
};
use crate::config::Config;
use crate::constants::{CERTIFICATE_PRINCIPAL_PREFIX, FREEIPA_API_VERSION};
use crate::directory_errors::DirectoryError;
use crate::extractor::in_zone;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{header, Client as HttpClient, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// RPC error: entry not found
const ERR_NOT_FOUND: i64 = 4001;
/// RPC error: entry already exists
const ERR_DUPLICATE_ENTRY: i64 = 4002;
/// RPC error: modification changes nothing
const ERR_EMPTY_MODLIST: i64 = 4202;
/// RPC error: server-side internal error
const ERR_INTERNAL: i64 = 903;
/// RPC error: server could not reach a backend
const ERR_NETWORK: i64 = 907;

/// Session cookie name set by the login endpoint
const SESSION_COOKIE: &str = "ipa_session";

/// Time formats FreeIPA uses for certificate validity fields
const IPA_TIME_FORMATS: &[&str] = &["%a %b %d %H:%M:%S %Y UTC", "%Y%m%d%H%M%SZ"];

/// Connection settings for [`FreeIpaClient`].
#[derive(Clone)]
pub struct FreeIpaSettings {
    /// Base URL, e.g. `https://ipa.example.com`
    pub base_url: String,
    /// Managed DNS zone
    pub zone: String,
    /// Login principal
    pub username: String,
    /// Login password
    pub password: String,
    /// Organization placed in CSRs
    pub organization: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Verify the server certificate
    pub verify_tls: bool,
}

impl std::fmt::Debug for FreeIpaSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeIpaSettings")
            .field("base_url", &self.base_url)
            .field("zone", &self.zone)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("verify_tls", &self.verify_tls)
            .finish_non_exhaustive()
    }
}

impl FreeIpaSettings {
    /// Build settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: build_base_url(&config.directory.server),
            zone: config.zone(),
            username: config.directory.username.clone(),
            password: config.directory.password.clone().unwrap_or_default(),
            organization: config.certificates.organization.clone(),
            request_timeout: Duration::from_secs(config.directory.request_timeout_secs),
            verify_tls: config.directory.verify_tls,
        }
    }
}

/// Build the base URL from a server address.
///
/// `ipa.example.com` becomes `https://ipa.example.com`; explicit schemes are kept.
#[must_use]
pub fn build_base_url(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{server}")
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

/// Failure of a single RPC: either a structured FreeIPA error or a transport problem.
#[derive(Debug)]
enum CallError {
    Rpc(RpcError),
    Directory(DirectoryError),
}

impl From<DirectoryError> for CallError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err)
    }
}

impl CallError {
    fn is_code(&self, code: i64) -> bool {
        matches!(self, Self::Rpc(e) if e.code == code)
    }

    fn into_directory_error(self, operation: &str, hostname: &str) -> DirectoryError {
        let err = match self {
            Self::Directory(err) => return err,
            Self::Rpc(err) => err,
        };
        match err.code {
            ERR_INTERNAL | ERR_NETWORK => DirectoryError::ServerError {
                operation: operation.to_string(),
                status: u16::try_from(err.code).unwrap_or(u16::MAX),
                message: err.message,
            },
            1000..=1999 => DirectoryError::Authentication {
                reason: format!("{}: {}", err.name, err.message),
            },
            3000..=3999 => DirectoryError::InvalidHostname {
                hostname: hostname.to_string(),
                reason: err.message,
            },
            code => DirectoryError::Rejected {
                operation: operation.to_string(),
                code,
                message: err.message,
            },
        }
    }
}

/// FreeIPA JSON-RPC client.
pub struct FreeIpaClient {
    http: HttpClient,
    settings: FreeIpaSettings,
    session: RwLock<Option<String>>,
}

impl FreeIpaClient {
    /// Create a client. No request is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: FreeIpaSettings) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .context("Failed to build FreeIPA HTTP client")?;
        Ok(Self {
            http,
            settings,
            session: RwLock::new(None),
        })
    }

    fn referer(&self) -> String {
        format!("{}/ipa", self.settings.base_url)
    }

    /// Hostname relative to the zone, `@` for the apex.
    fn relative_name(&self, hostname: &str) -> Result<String, DirectoryError> {
        let zone = &self.settings.zone;
        if !in_zone(hostname, zone) {
            return Err(DirectoryError::InvalidHostname {
                hostname: hostname.to_string(),
                reason: format!("outside zone {zone}"),
            });
        }
        Ok(hostname
            .strip_suffix(zone.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
            .unwrap_or("@")
            .to_string())
    }

    fn transport_error(&self, operation: &str, err: &reqwest::Error) -> DirectoryError {
        if err.is_timeout() {
            DirectoryError::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(self.settings.request_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }
        } else {
            DirectoryError::Connection {
                reason: format!("{operation}: {err}"),
            }
        }
    }

    /// Log in and return the session cookie pair (`ipa_session=...`).
    async fn login(&self) -> Result<String, DirectoryError> {
        debug!(server = %self.settings.base_url, user = %self.settings.username, "Logging in to FreeIPA");

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("user", &self.settings.username)
            .append_pair("password", &self.settings.password)
            .finish();

        let response = self
            .http
            .post(format!("{}/ipa/session/login_password", self.settings.base_url))
            .header(header::REFERER, self.referer())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error("login", &e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let reason = response
                .headers()
                .get("X-IPA-Rejection-Reason")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("credentials rejected")
                .to_string();
            return Err(DirectoryError::Authentication { reason });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(status_error("login", status, message));
        }

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .find(|pair| pair.starts_with(&format!("{SESSION_COOKIE}=")))
            .map(str::to_string)
            .ok_or_else(|| DirectoryError::Authentication {
                reason: "login response carried no session cookie".to_string(),
            })?;

        info!(server = %self.settings.base_url, "Authenticated to FreeIPA");
        Ok(cookie)
    }

    async fn session_cookie(&self) -> Result<String, DirectoryError> {
        if let Some(cookie) = self.session.read().await.clone() {
            return Ok(cookie);
        }
        let mut guard = self.session.write().await;
        if let Some(cookie) = guard.clone() {
            return Ok(cookie);
        }
        let cookie = self.login().await?;
        *guard = Some(cookie.clone());
        Ok(cookie)
    }

    /// Execute one JSON-RPC command and return its output object.
    async fn call(&self, method: &str, args: Value, options: Value) -> Result<Value, CallError> {
        let mut options = options;
        if let Value::Object(map) = &mut options {
            map.insert("version".to_string(), json!(FREEIPA_API_VERSION));
        }
        let body = json!({ "method": method, "params": [args, options], "id": 0 });

        let mut cookie = self.session_cookie().await?;
        let mut relogged = false;

        loop {
            debug!(method = %method, "FreeIPA RPC request");

            let response = self
                .http
                .post(format!("{}/ipa/session/json", self.settings.base_url))
                .header(header::REFERER, self.referer())
                .header(header::ACCEPT, "application/json")
                .header(header::COOKIE, &cookie)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.transport_error(method, &e))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if relogged {
                    return Err(DirectoryError::Authentication {
                        reason: "session rejected right after login".to_string(),
                    }
                    .into());
                }
                warn!(method = %method, "FreeIPA session expired, logging in again");
                *self.session.write().await = None;
                cookie = self.session_cookie().await?;
                relogged = true;
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(status_error(method, status, message).into());
            }

            let rpc: RpcResponse =
                response
                    .json()
                    .await
                    .map_err(|e| DirectoryError::UnexpectedResponse {
                        operation: method.to_string(),
                        reason: e.to_string(),
                    })?;

            if let Some(err) = rpc.error {
                debug!(method = %method, code = err.code, name = %err.name, "FreeIPA RPC error");
                return Err(CallError::Rpc(err));
            }
            return rpc.result.ok_or_else(|| {
                DirectoryError::UnexpectedResponse {
                    operation: method.to_string(),
                    reason: "response has neither result nor error".to_string(),
                }
                .into()
            });
        }
    }

    /// Create an entry, treating "already exists" as success.
    async fn ensure_entry(&self, method: &str, key: &str, hostname: &str) -> Result<(), DirectoryError> {
        match self.call(method, json!([key]), json!({ "force": true })).await {
            Ok(_) => {
                info!(method = %method, entry = %key, "Created FreeIPA entry");
                Ok(())
            }
            Err(e) if e.is_code(ERR_DUPLICATE_ENTRY) => {
                debug!(method = %method, entry = %key, "FreeIPA entry already exists");
                Ok(())
            }
            Err(e) => Err(e.into_directory_error(method, hostname)),
        }
    }
}

/// Map an unexpected HTTP status to a directory error.
fn status_error(operation: &str, status: StatusCode, message: String) -> DirectoryError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => DirectoryError::RateLimited {
            operation: operation.to_string(),
        },
        s if s.is_server_error() => DirectoryError::ServerError {
            operation: operation.to_string(),
            status: s.as_u16(),
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Authentication {
            reason: format!("HTTP {status} during {operation}"),
        },
        s => DirectoryError::Rejected {
            operation: operation.to_string(),
            code: i64::from(s.as_u16()),
            message,
        },
    }
}

/// First string of a field that may be a scalar or a single-element list.
fn first_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    }
}

fn strings(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// A/AAAA addresses held by a `dnsrecord_show` result.
fn record_addresses(result: &Value) -> BTreeSet<IpAddr> {
    ["arecord", "aaaarecord"]
        .iter()
        .flat_map(|key| strings(&result[*key]))
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

/// `dnsrecord_add`/`dnsrecord_del` options for a set of addresses.
fn address_options(addresses: &BTreeSet<IpAddr>) -> Value {
    let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = addresses.iter().partition(|a| a.is_ipv4());
    let mut options = serde_json::Map::new();
    if !v4.is_empty() {
        options.insert(
            "arecord".to_string(),
            json!(v4.iter().map(ToString::to_string).collect::<Vec<_>>()),
        );
    }
    if !v6.is_empty() {
        options.insert(
            "aaaarecord".to_string(),
            json!(v6.iter().map(ToString::to_string).collect::<Vec<_>>()),
        );
    }
    Value::Object(options)
}

fn serial_of(value: &Value) -> Option<String> {
    match &value["serial_number"] {
        Value::Number(n) => Some(n.to_string()),
        other => first_str(other).map(str::to_string),
    }
}

/// Parse a FreeIPA validity timestamp.
fn parse_ipa_time(value: &Value) -> Option<DateTime<Utc>> {
    let raw = first_str(value)?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    IPA_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Base64 DER (possibly wrapped as `{"__base64__": ...}`) to PEM.
fn certificate_pem(value: &Value) -> Option<String> {
    let encoded = first_str(value).or_else(|| value["__base64__"].as_str())?;
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let der = BASE64.decode(compact.as_bytes()).ok()?;
    let body = BASE64.encode(der);

    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    Some(pem)
}

fn is_revoked(entry: &Value) -> bool {
    entry["revoked"].as_bool() == Some(true)
        || first_str(&entry["status"]).is_some_and(|s| s.eq_ignore_ascii_case("REVOKED"))
}

#[async_trait]
impl DirectoryClient for FreeIpaClient {
    async fn upsert_record(&self, hostname: &str, addresses: &BTreeSet<IpAddr>) -> RecordResult {
        let name = self.relative_name(hostname)?;
        let zone = self.settings.zone.as_str();

        let current = match self
            .call("dnsrecord_show", json!([zone, name]), json!({}))
            .await
        {
            Ok(output) => record_addresses(&output["result"]),
            Err(e) if e.is_code(ERR_NOT_FOUND) => BTreeSet::new(),
            Err(e) => return Err(e.into_directory_error("dnsrecord_show", hostname)),
        };

        if current == *addresses {
            debug!(hostname = %hostname, "DNS record already up to date");
            return Ok(RecordChange::Unchanged);
        }

        let to_add: BTreeSet<IpAddr> = addresses.difference(&current).copied().collect();
        let to_remove: BTreeSet<IpAddr> = current.difference(addresses).copied().collect();

        if !to_add.is_empty() {
            match self
                .call("dnsrecord_add", json!([zone, name]), address_options(&to_add))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_code(ERR_DUPLICATE_ENTRY) || e.is_code(ERR_EMPTY_MODLIST) => {}
                Err(e) => return Err(e.into_directory_error("dnsrecord_add", hostname)),
            }
        }
        if !to_remove.is_empty() {
            match self
                .call("dnsrecord_del", json!([zone, name]), address_options(&to_remove))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_code(ERR_NOT_FOUND) => {}
                Err(e) => return Err(e.into_directory_error("dnsrecord_del", hostname)),
            }
        }

        let change = if current.is_empty() {
            RecordChange::Created
        } else {
            RecordChange::Updated
        };
        info!(
            hostname = %hostname,
            added = ?to_add,
            removed = ?to_remove,
            change = change.as_str(),
            "Applied DNS record"
        );
        Ok(change)
    }

    async fn delete_record(&self, hostname: &str) -> RecordResult {
        let name = self.relative_name(hostname)?;
        match self
            .call(
                "dnsrecord_del",
                json!([self.settings.zone, name]),
                json!({ "del_all": true }),
            )
            .await
        {
            Ok(_) => {
                info!(hostname = %hostname, "Deleted DNS record");
                Ok(RecordChange::Deleted)
            }
            Err(e) if e.is_code(ERR_NOT_FOUND) => {
                debug!(hostname = %hostname, "DNS record already absent");
                Ok(RecordChange::Absent)
            }
            Err(e) => Err(e.into_directory_error("dnsrecord_del", hostname)),
        }
    }

    async fn request_certificate(&self, hostname: &str, validity_days: u32) -> CertResult {
        self.relative_name(hostname)?;
        let principal = format!("{CERTIFICATE_PRINCIPAL_PREFIX}/{hostname}");

        self.ensure_entry("host_add", hostname, hostname).await?;
        self.ensure_entry("service_add", &principal, hostname).await?;

        let request = csr::signing_request(hostname, self.settings.organization.as_deref())
            .map_err(|e| DirectoryError::CertificateRequest {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            })?;

        let requested = self
            .call(
                "cert_request",
                json!([request.csr_pem]),
                json!({ "principal": principal }),
            )
            .await
            .map_err(|e| e.into_directory_error("cert_request", hostname))?;
        let serial =
            serial_of(&requested["result"]).ok_or_else(|| DirectoryError::UnexpectedResponse {
                operation: "cert_request".to_string(),
                reason: "no serial number in response".to_string(),
            })?;

        let shown = self
            .call("cert_show", json!([serial]), json!({}))
            .await
            .map_err(|e| e.into_directory_error("cert_show", hostname))?;
        let shown = &shown["result"];

        let certificate_pem =
            certificate_pem(&shown["certificate"]).ok_or_else(|| DirectoryError::UnexpectedResponse {
                operation: "cert_show".to_string(),
                reason: format!("certificate {serial} missing or not base64"),
            })?;
        let not_after = parse_ipa_time(&shown["valid_not_after"])
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(i64::from(validity_days)));

        info!(hostname = %hostname, serial = %serial, not_after = %not_after, "Certificate issued");

        Ok(IssuedCertificate {
            info: CertificateInfo {
                serial,
                not_before: parse_ipa_time(&shown["valid_not_before"]),
                not_after,
            },
            material: CertificateMaterial {
                certificate_pem,
                private_key_pem: request.private_key_pem,
            },
        })
    }

    async fn get_certificate_status(&self, hostname: &str) -> CertStatusResult {
        let output = self
            .call(
                "cert_find",
                json!([]),
                json!({ "subject": hostname, "exactly": true }),
            )
            .await
            .map_err(|e| e.into_directory_error("cert_find", hostname))?;

        let latest = output["result"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|entry| !is_revoked(entry))
            .filter_map(|entry| {
                Some(CertificateInfo {
                    serial: serial_of(entry)?,
                    not_before: parse_ipa_time(&entry["valid_not_before"]),
                    not_after: parse_ipa_time(&entry["valid_not_after"])?,
                })
            })
            .max_by_key(|info| info.not_after);

        debug!(hostname = %hostname, found = latest.is_some(), "Queried certificate status");
        Ok(latest)
    }
}

#[cfg(test)]
#[path = "freeipa_tests.rs"]
mod freeipa_tests;
