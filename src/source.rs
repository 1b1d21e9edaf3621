// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Kubernetes `Service` observation.
//!
//! Turns the `kube` watch stream into [`EngineInput`]s, in order, on the engine's input
//! channel. Every watch (re)start produces one [`EngineInput::Resync`] with the full
//! listing, and a periodic list produces another, so events missed while the watch was
//! down are healed. Each listing is stamped with the instant it was requested, which
//! lets the engine tell it apart from newer watch events.

use crate::config::Config;
use crate::events::{EngineInput, EventKind, Inventory, ServiceEvent};
use crate::extractor::ServiceMetadata;
use anyhow::{Context as _, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Watch scope and resync timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Period of the full-inventory list
    pub resync_interval: Duration,
    /// Timeout of one list call
    pub api_timeout: Duration,
}

impl SourceSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.orchestrator.namespace.clone(),
            resync_interval: Duration::from_secs(config.orchestrator.resync_interval_secs),
            api_timeout: Duration::from_secs(config.orchestrator.api_timeout_secs),
        }
    }
}

/// `<namespace>/<name>` of a service.
#[must_use]
pub fn service_id(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_else(|| "default".to_string()),
        service.name_any()
    )
}

/// Labels merged with annotations; annotations win on conflicting keys.
#[must_use]
pub fn merged_metadata(service: &Service) -> ServiceMetadata {
    let mut metadata: ServiceMetadata = service.labels().clone();
    metadata.extend(
        service
            .annotations()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    metadata
}

/// Load-balancer ingress IPs; hostname-only ingress entries are ignored.
#[must_use]
pub fn ingress_addresses(service: &Service) -> BTreeSet<IpAddr> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| ingress.ip.as_deref())
        .filter_map(|ip| match ip.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!(ip = %ip, service = %service.name_any(), "Ignoring unparseable ingress IP");
                None
            }
        })
        .collect()
}

/// Build the engine's view of `service`.
#[must_use]
pub fn service_event_from(service: &Service, kind: EventKind) -> ServiceEvent {
    let mut event = ServiceEvent::new(&service_id(service), kind);
    event.metadata = merged_metadata(service);
    event.addresses = ingress_addresses(service);
    event
}

/// Maps raw watcher events onto engine inputs.
///
/// Remembers which services it has seen, to tell `Created` from `Updated`, and buffers
/// the initial listing of each watch (re)start into one resync.
#[derive(Debug, Default)]
pub struct WatchTranslator {
    seen: HashSet<String>,
    listing: Option<(Instant, Vec<ServiceEvent>)>,
}

impl WatchTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one watcher event. Returns `None` while an initial listing is buffered.
    pub fn translate(&mut self, event: watcher::Event<Service>) -> Option<EngineInput> {
        match event {
            watcher::Event::Apply(service) => {
                let id = service_id(&service);
                let kind = if self.seen.insert(id) {
                    EventKind::Created
                } else {
                    EventKind::Updated
                };
                Some(EngineInput::Event(service_event_from(&service, kind)))
            }
            watcher::Event::Delete(service) => {
                self.seen.remove(&service_id(&service));
                Some(EngineInput::Event(service_event_from(
                    &service,
                    EventKind::Removed,
                )))
            }
            watcher::Event::Init => {
                debug!("Watch (re)started, buffering initial listing");
                self.listing = Some((Instant::now(), Vec::new()));
                None
            }
            watcher::Event::InitApply(service) => {
                let kind = if self.seen.contains(&service_id(&service)) {
                    EventKind::Updated
                } else {
                    EventKind::Created
                };
                self.listing
                    .get_or_insert_with(|| (Instant::now(), Vec::new()))
                    .1
                    .push(service_event_from(&service, kind));
                None
            }
            watcher::Event::InitDone => {
                let inventory = match self.listing.take() {
                    Some((listed_at, services)) => Inventory::new(listed_at, services),
                    None => Inventory::taken_now(Vec::new()),
                };
                self.seen = inventory
                    .services
                    .iter()
                    .map(|e| e.service_id.clone())
                    .collect();
                info!(services = inventory.services.len(), "Initial service listing complete");
                Some(EngineInput::Resync(inventory))
            }
        }
    }
}

/// `Api<Service>` scoped per settings.
#[must_use]
pub fn service_api(client: Client, settings: &SourceSettings) -> Api<Service> {
    match settings.namespace.as_deref() {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Watch services and feed the engine until its input channel closes.
///
/// # Errors
///
/// Currently never fails; watch errors are logged and retried with backoff.
pub async fn run_watch(api: Api<Service>, tx: mpsc::Sender<EngineInput>) -> Result<()> {
    info!("Starting service watch");

    let mut translator = WatchTranslator::new();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(input) = translator.translate(event) {
                    if tx.send(input).await.is_err() {
                        info!("Engine input closed, stopping service watch");
                        return Ok(());
                    }
                }
            }
            Err(e) => warn!(error = %e, "Service watch error, backing off"),
        }
    }

    Ok(())
}

/// List every service once, stamped with the instant the request started.
///
/// # Errors
///
/// Returns an error if the list call fails or exceeds `timeout`.
pub async fn list_services(api: &Api<Service>, timeout: Duration) -> Result<Inventory> {
    let listed_at = Instant::now();
    let list = tokio::time::timeout(timeout, api.list(&ListParams::default()))
        .await
        .context("service list timed out")?
        .context("failed to list services")?;

    let services = list
        .items
        .iter()
        .map(|service| service_event_from(service, EventKind::Updated))
        .collect();
    Ok(Inventory::new(listed_at, services))
}

/// Feed the engine a full listing every `resync_interval` until its input closes.
///
/// A failed list is logged and skipped.
///
/// # Errors
///
/// Currently never fails.
pub async fn run_periodic_resync(
    api: Api<Service>,
    settings: SourceSettings,
    tx: mpsc::Sender<EngineInput>,
) -> Result<()> {
    let mut interval = tokio::time::interval(settings.resync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The watch's initial listing covers startup.
    interval.tick().await;

    loop {
        interval.tick().await;
        match list_services(&api, settings.api_timeout).await {
            Ok(inventory) => {
                debug!(services = inventory.services.len(), "Periodic resync listing");
                if tx.send(EngineInput::Resync(inventory)).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "Periodic resync skipped"),
        }
    }
}

#[cfg(test)]
#[path = "source_tests.rs"]
mod source_tests;
