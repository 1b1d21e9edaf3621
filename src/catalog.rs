// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Read-only service catalog over HTTP.
//!
//! Serves what the engine currently manages, plus manually configured links, as an
//! HTML page and a JSON API. The server never touches the state store: it reads the
//! latest [`StoreSnapshot`] the engine broadcast on its watch channel.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /`, `GET /index.html` | HTML catalog grouped by category |
//! | `GET /api/services` | `{services, total, timestamp}` |
//! | `GET /health` | `OK` |
//! | `GET /metrics` | Prometheus text exposition |

use crate::config::{Config, ManualService};
use crate::metrics;
use crate::state::StoreSnapshot;
use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const INFRASTRUCTURE_MARKERS: [&str; 6] = [
    "traefik",
    "portainer",
    "prometheus",
    "grafana",
    "dns",
    "catalog",
];
const MONITORING_MARKERS: [&str; 4] = ["monitor", "cadvisor", "node-exporter", "alertmanager"];

const PAGE_STYLE: &str = r"
* { margin: 0; padding: 0; box-sizing: border-box; }
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #4a5fc1; min-height: 100vh; padding: 20px; }
.container { max-width: 1200px; margin: 0 auto; }
header, footer { text-align: center; color: white; }
header { margin-bottom: 32px; }
h1 { font-size: 2.4em; margin-bottom: 8px; }
.stats { display: flex; gap: 16px; justify-content: center; flex-wrap: wrap; margin-bottom: 32px; }
.stat { background: white; padding: 16px 28px; border-radius: 10px; text-align: center; }
.stat b { display: block; font-size: 2em; color: #4a5fc1; }
.category { margin-bottom: 24px; }
.category h2 { background: white; padding: 12px 20px; border-radius: 10px 10px 0 0; color: #333; }
.services { display: grid; grid-template-columns: repeat(auto-fill, minmax(300px, 1fr)); gap: 14px; padding: 14px; background: #eef0fa; border-radius: 0 0 10px 10px; }
.card { display: block; background: white; padding: 18px; border-radius: 8px; color: inherit; text-decoration: none; }
.card .name { font-weight: bold; color: #4a5fc1; margin-bottom: 6px; }
.card .url { color: #666; font-size: 0.9em; word-break: break-all; margin-bottom: 6px; }
.card .description { color: #888; font-size: 0.9em; }
.badge { display: inline-block; padding: 3px 10px; border-radius: 12px; font-size: 0.75em; font-weight: bold; margin-top: 8px; }
.auto { background: #e3f2fd; color: #1976d2; }
.manual { background: #f3e5f5; color: #7b1fa2; }
.cert { background: #e8f5e9; color: #388e3c; }
footer { margin-top: 32px; opacity: 0.85; }
";

/// Page text and manual entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSettings {
    /// Page title
    pub title: String,
    /// Subtitle
    pub description: String,
    /// Entries not discovered from the orchestrator
    pub manual_services: Vec<ManualService>,
}

impl CatalogSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            title: config.catalog.title.clone(),
            description: config.catalog.description.clone(),
            manual_services: config.catalog.manual_services.clone(),
        }
    }
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Hostname, or a slug of the name for manual entries
    pub id: String,
    /// Orchestrator service name; empty for manual entries
    pub service_name: String,
    /// Display name
    pub name: String,
    /// Fully-qualified hostname; empty for manual entries
    pub hostname: String,
    /// Link target
    pub url: String,
    /// Free-text description
    pub description: String,
    /// Section the entry is listed under
    pub category: String,
    /// Whether the entry came from the orchestrator
    pub auto_discovered: bool,
    /// Whether the link is served with TLS
    pub has_certificate: bool,
    /// Snapshot time for discovered entries, render time for manual ones
    pub last_updated: DateTime<Utc>,
}

/// Counters shown above the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogTotals {
    pub total: usize,
    pub auto_discovered: usize,
    pub manual: usize,
    pub with_certificate: usize,
}

impl CatalogTotals {
    #[must_use]
    pub fn of(entries: &[CatalogEntry]) -> Self {
        let auto_discovered = entries.iter().filter(|e| e.auto_discovered).count();
        Self {
            total: entries.len(),
            auto_discovered,
            manual: entries.len() - auto_discovered,
            with_certificate: entries.iter().filter(|e| e.has_certificate).count(),
        }
    }
}

/// Category from well-known fragments of the service name.
#[must_use]
pub fn derive_category(service_name: &str) -> &'static str {
    let name = service_name.to_ascii_lowercase();
    if INFRASTRUCTURE_MARKERS.iter().any(|m| name.contains(m)) {
        "Infrastructure"
    } else if MONITORING_MARKERS.iter().any(|m| name.contains(m)) {
        "Monitoring"
    } else {
        "Applications"
    }
}

/// `my_app-server` → `My App Server`.
#[must_use]
pub fn display_name(service_name: &str) -> String {
    service_name
        .split(['_', '-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Catalog rows for a snapshot plus the manual entries.
#[must_use]
pub fn entries(snapshot: &StoreSnapshot, manual: &[ManualService], now: DateTime<Utc>) -> Vec<CatalogEntry> {
    let discovered = snapshot.hostnames.iter().map(|h| CatalogEntry {
        id: h.name.clone(),
        service_name: h.service_name.clone(),
        name: display_name(&h.service_name),
        hostname: h.name.clone(),
        url: format!("https://{}", h.name),
        description: h.description.clone(),
        category: if h.category.trim().is_empty() {
            derive_category(&h.service_name).to_string()
        } else {
            h.category.clone()
        },
        auto_discovered: true,
        has_certificate: h.certificate_not_after.is_some(),
        last_updated: snapshot.taken_at,
    });

    let configured = manual.iter().map(|m| CatalogEntry {
        id: m.name.to_lowercase().replace(' ', "-"),
        service_name: String::new(),
        name: m.name.clone(),
        hostname: String::new(),
        url: m.url.clone(),
        description: m.description.clone(),
        category: m.category.clone(),
        auto_discovered: false,
        has_certificate: m.url.starts_with("https://"),
        last_updated: now,
    });

    discovered.chain(configured).collect()
}

/// Render the HTML catalog. Every interpolated value is escaped.
#[must_use]
pub fn render_page(settings: &CatalogSettings, entries: &[CatalogEntry], now: DateTime<Utc>) -> String {
    let totals = CatalogTotals::of(entries);

    let mut by_category: BTreeMap<&str, Vec<&CatalogEntry>> = BTreeMap::new();
    for entry in entries {
        by_category.entry(entry.category.as_str()).or_default().push(entry);
    }

    let mut sections = String::new();
    for (category, mut members) in by_category {
        members.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        let _ = write!(
            sections,
            r#"<section class="category"><h2>{}</h2><div class="services">"#,
            encode_text(category)
        );
        for entry in members {
            let (badge_class, badge_text) = if entry.auto_discovered {
                ("auto", "Auto")
            } else {
                ("manual", "Manual")
            };
            let cert_badge = if entry.has_certificate {
                r#" <span class="badge cert">SSL</span>"#
            } else {
                ""
            };
            let _ = write!(
                sections,
                r#"<a class="card" href="{href}" target="_blank" rel="noopener"><div class="name">{name}</div><div class="url">{url}</div><div class="description">{description}</div><span class="badge {badge_class}">{badge_text}</span>{cert_badge}</a>"#,
                href = encode_double_quoted_attribute(&entry.url),
                name = encode_text(&entry.name),
                url = encode_text(&entry.url),
                description = encode_text(&entry.description),
            );
        }
        sections.push_str("</div></section>");
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>{PAGE_STYLE}</style>
</head>
<body>
<div class="container">
<header><h1>{title}</h1><p>{description}</p></header>
<div class="stats">
<div class="stat"><b>{total}</b>Total Services</div>
<div class="stat"><b>{auto}</b>Auto-discovered</div>
<div class="stat"><b>{manual}</b>Manual</div>
<div class="stat"><b>{certs}</b>With Certificates</div>
</div>
{sections}
<footer>Last updated: {updated}</footer>
</div>
</body>
</html>
"#,
        title = encode_text(&settings.title),
        description = encode_text(&settings.description),
        total = totals.total,
        auto = totals.auto_discovered,
        manual = totals.manual,
        certs = totals.with_certificate,
        updated = now.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[derive(Clone)]
struct CatalogState {
    settings: Arc<CatalogSettings>,
    snapshots: watch::Receiver<StoreSnapshot>,
}

impl CatalogState {
    fn entries(&self, now: DateTime<Utc>) -> Vec<CatalogEntry> {
        let snapshot = self.snapshots.borrow().clone();
        entries(&snapshot, &self.settings.manual_services, now)
    }
}

/// Build the catalog router.
pub fn router(settings: CatalogSettings, snapshots: watch::Receiver<StoreSnapshot>) -> Router {
    let state = CatalogState {
        settings: Arc::new(settings),
        snapshots,
    };
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/api/services", get(api_services))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn index(State(state): State<CatalogState>) -> Response {
    let now = Utc::now();
    let page = render_page(&state.settings, &state.entries(now), now);
    ([(header::CACHE_CONTROL, "no-cache")], Html(page)).into_response()
}

async fn api_services(State(state): State<CatalogState>) -> Response {
    let now = Utc::now();
    let services = state.entries(now);
    let body = json!({
        "total": services.len(),
        "services": services,
        "timestamp": now.to_rfc3339(),
    });
    ([(header::CACHE_CONTROL, "no-cache")], Json(body)).into_response()
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve the catalog on `bind_address` until the process exits.
///
/// # Errors
///
/// Returns an error if the address is invalid, cannot be bound, or the server fails.
pub async fn serve(
    bind_address: &str,
    settings: CatalogSettings,
    snapshots: watch::Receiver<StoreSnapshot>,
) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("invalid catalog bind address '{bind_address}'"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind catalog server to {addr}"))?;

    info!(address = %addr, "Catalog server listening");
    axum::serve(listener, router(settings, snapshots))
        .await
        .context("catalog server failed")
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod catalog_tests;
