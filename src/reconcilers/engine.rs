// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The reconciliation engine.
//!
//! The engine owns the [`StateStore`] and is the only thing that mutates it. One loop
//! consumes service events in arrival order, diffs each service's desired hostnames
//! against the store, and dispatches [`ReconciliationTask`]s. Tasks run concurrently
//! across hostnames, one at a time per hostname and in dispatch order per hostname
//! (see [`HostnameLocks`]). Their reports come back into the same loop.
//!
//! # Per-hostname state machine
//!
//! ```text
//! Absent ──claim──▶ Pending ──ok──▶ Applied ──address/owner change──▶ Pending
//!                      │                                                 │
//!                      └──failure──▶ Failed ──event / resync retry───────┘
//! any ──owner removed, delete ok──▶ (dropped from the store)
//! ```
//!
//! # Generations
//!
//! Each record task bumps the hostname's generation. A report whose generation is no
//! longer current is stale: a newer task for the same hostname has been dispatched
//! and will report the authoritative record state. Certificate material from a stale
//! report still counts, because it was written to disk.
//!
//! # Self-healing
//!
//! A resync replays the full service inventory. Services missing from it are treated
//! as removed; hostnames that failed retryably are retried; permanently failed ones
//! wait for a genuine event.
//!
//! Listings and watch events come from different producers, so a listing may be older
//! than events already handled. Services the engine has seen an event for since the
//! listing was requested are left alone, and a listing older than one already applied
//! is dropped.

use super::certificates::{self, CertificateAction, CertificateOutcome};
use super::locks::HostnameLocks;
use super::tasks::{self, ReconciliationTask, RecordOutcome, TaskReason, TaskReport};
use crate::config::{AddressSource, Config};
use crate::context::Context;
use crate::directory_errors::FailureClass;
use crate::events::{EngineInput, EventKind, Inventory, ServiceEvent};
use crate::extractor::{self, Extraction, ExtractorSettings};
use crate::labels::{CATEGORY_LABEL, DESCRIPTION_LABEL};
use crate::metrics;
use crate::publisher::ServedCertificate;
use crate::state::{CertificateStatus, FailureRecord, RecordState, StateStore, StoreSnapshot};
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Engine settings that never reach the tasks.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How hostnames are derived from metadata
    pub extractor: ExtractorSettings,
    /// Where DNS targets come from
    pub address_source: AddressSource,
    /// Targets when `address_source` is `Configured`
    pub load_balancer_addresses: BTreeSet<IpAddr>,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            extractor: ExtractorSettings::from_config(config),
            address_source: config.orchestrator.address_source,
            load_balancer_addresses: config.load_balancer_addresses.iter().copied().collect(),
        }
    }
}

/// What caused a service to be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A watch event
    Event,
    /// A full-inventory resync
    Resync,
}

/// Bookkeeping for a running task.
#[derive(Debug, Clone)]
struct InFlight {
    hostname: String,
    generation: u64,
    reason: TaskReason,
}

/// The reconciliation engine.
pub struct Engine {
    ctx: Arc<Context>,
    settings: EngineSettings,
    store: StateStore,
    locks: HostnameLocks,
    tasks: JoinSet<TaskReport>,
    in_flight: HashMap<Id, InFlight>,
    next_generation: u64,
    certificates_dirty: bool,
    retired: BTreeSet<String>,
    /// When each service's latest event was handled, for services newer than the last inventory
    observed: HashMap<String, Instant>,
    /// `listed_at` of the newest inventory applied
    last_inventory: Option<Instant>,
    snapshot_tx: watch::Sender<StoreSnapshot>,
}

impl Engine {
    /// Create an engine with an empty store.
    #[must_use]
    pub fn new(ctx: Arc<Context>, settings: EngineSettings) -> Self {
        let (snapshot_tx, _) = watch::channel(StoreSnapshot::default());
        Self {
            ctx,
            settings,
            store: StateStore::new(),
            locks: HostnameLocks::new(),
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            next_generation: 0,
            certificates_dirty: false,
            retired: BTreeSet::new(),
            observed: HashMap::new(),
            last_inventory: None,
            snapshot_tx,
        }
    }

    /// Receive a fresh [`StoreSnapshot`] after every store mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Read-only view of the store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Number of tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Run until the input channel closes, then finish in-flight work.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature leaves room for fatal conditions.
    pub async fn run(mut self, mut input: mpsc::Receiver<EngineInput>) -> Result<()> {
        let mut sweep = tokio::time::interval(self.ctx.certificates.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the store is empty at that point.
        sweep.tick().await;

        info!(
            sweep_interval = ?self.ctx.certificates.sweep_interval,
            certificates = self.ctx.certificates.enabled,
            "Reconciliation engine started"
        );

        loop {
            tokio::select! {
                received = input.recv() => match received {
                    Some(message) => self.handle_input(message),
                    None => {
                        info!(in_flight = self.tasks.len(), "Input closed, draining in-flight tasks");
                        self.drain().await;
                        return Ok(());
                    }
                },
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined);
                    self.publish_certificates().await;
                    self.publish_snapshot();
                }
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    /// Process one input message.
    pub fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Event(event) => self.handle_event(&event),
            EngineInput::Resync(inventory) => self.resync(&inventory),
        }
    }

    /// Diff one service event against the store and dispatch the resulting tasks.
    pub fn handle_event(&mut self, event: &ServiceEvent) {
        debug!(service_id = %event.service_id, kind = ?event.kind, "Handling service event");
        self.observed.insert(event.service_id.clone(), Instant::now());
        self.reconcile_service(event, Trigger::Event);
        self.publish_snapshot();
    }

    /// Reconcile the full inventory.
    ///
    /// Every listed service is diffed like an event. Owners missing from the listing
    /// lose their hostnames. Released hostnames whose delete failed retryably get a
    /// new delete. Services with an event handled after `listed_at` are skipped.
    pub fn resync(&mut self, inventory: &Inventory) {
        if self
            .last_inventory
            .is_some_and(|last| inventory.listed_at < last)
        {
            warn!(
                services = inventory.services.len(),
                "Inventory is older than one already applied, skipping"
            );
            return;
        }
        self.last_inventory = Some(inventory.listed_at);
        // Events handled before the listing was requested are covered by it.
        self.observed.retain(|_, at| *at > inventory.listed_at);

        info!(
            services = inventory.services.len(),
            newer_events = self.observed.len(),
            "Resync started"
        );

        let listed: BTreeSet<&str> = inventory
            .services
            .iter()
            .map(|e| e.service_id.as_str())
            .collect();
        for event in &inventory.services {
            if self.observed.contains_key(&event.service_id) {
                debug!(service_id = %event.service_id, "Service changed after the listing, keeping event state");
                continue;
            }
            self.reconcile_service(event, Trigger::Resync);
        }

        for owner in self.store.owners() {
            if listed.contains(owner.as_str()) || self.observed.contains_key(&owner) {
                continue;
            }
            info!(service_id = %owner, "Service vanished while unobserved, releasing its hostnames");
            self.reconcile_service(&ServiceEvent::new(&owner, EventKind::Removed), Trigger::Resync);
        }

        let stuck: Vec<String> = self
            .store
            .iter()
            .filter(|e| e.is_released() && e.record_state == RecordState::Failed)
            .filter(|e| e.last_failure.as_ref().is_none_or(FailureRecord::is_retryable))
            .map(|e| e.name.clone())
            .collect();
        for hostname in stuck {
            self.dispatch(&hostname, TaskReason::Remove, BTreeSet::new(), CertificateAction::None);
        }

        self.publish_snapshot();
    }

    /// Periodic certificate sweep: refresh expiry statuses, then dispatch renewals.
    pub fn sweep(&mut self) {
        let now = Utc::now();
        let policy = &self.ctx.certificates;
        if !policy.enabled {
            return;
        }

        let expiring = certificates::refresh_statuses(&mut self.store, policy, now);
        let due = certificates::due_for_sweep(&self.store, policy, now);
        info!(expiring = expiring, due = due.len(), "Certificate sweep");

        for (hostname, action) in due {
            self.dispatch(&hostname, TaskReason::CertRenew, BTreeSet::new(), action);
        }
        self.publish_snapshot();
    }

    /// Wait for every in-flight task and fold in its report.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.on_joined(joined);
        }
        self.publish_certificates().await;
        self.publish_snapshot();
    }

    fn reconcile_service(&mut self, event: &ServiceEvent, trigger: Trigger) {
        let extraction = if event.kind == EventKind::Removed {
            Extraction::default()
        } else {
            extractor::extract(&self.settings.extractor, &event.metadata)
        };

        if !extraction.warnings.is_empty() {
            metrics::record_extraction_warnings(extraction.warnings.len());
            for warning in &extraction.warnings {
                warn!(service_id = %event.service_id, warning = %warning, "Extraction warning");
            }
        }

        let addresses = match self.settings.address_source {
            AddressSource::Configured => self.settings.load_balancer_addresses.clone(),
            AddressSource::Service => event.addresses.clone(),
        };
        let previously_owned = self.store.owned_by(&event.service_id);
        for hostname in previously_owned.difference(&extraction.hostnames) {
            self.release(hostname, &event.service_id);
        }

        if !extraction.hostnames.is_empty() && addresses.is_empty() {
            warn!(
                service_id = %event.service_id,
                hostnames = ?extraction.hostnames,
                "Service has no load-balancer addresses yet, deferring its claims"
            );
            return;
        }

        for hostname in &extraction.hostnames {
            self.claim(hostname, event, &addresses, trigger);
        }
    }

    fn claim(
        &mut self,
        hostname: &str,
        event: &ServiceEvent,
        addresses: &BTreeSet<IpAddr>,
        trigger: Trigger,
    ) {
        let now = Utc::now();
        let policy = &self.ctx.certificates;
        let entry = self.store.entry(hostname);

        let previous_owner = entry.owning_service_id.clone();
        if let Some(previous) = previous_owner.as_deref() {
            if previous != event.service_id {
                warn!(
                    hostname = %hostname,
                    previous_owner = %previous,
                    new_owner = %event.service_id,
                    "Hostname claimed by another service, last writer wins"
                );
                metrics::record_ownership_conflict();
            }
        }
        let reowned = previous_owner.as_deref() != Some(event.service_id.as_str());
        let addresses_changed = entry.desired_addresses != *addresses;

        entry.owning_service_id = Some(event.service_id.clone());
        entry.service_name.clone_from(&event.name);
        entry.category = event.metadata.get(CATEGORY_LABEL).cloned().unwrap_or_default();
        entry.description = event
            .metadata
            .get(DESCRIPTION_LABEL)
            .cloned()
            .unwrap_or_default();

        let needs_record = match entry.record_state {
            RecordState::Absent => true,
            RecordState::Pending | RecordState::Applied => reowned || addresses_changed,
            RecordState::Failed => {
                reowned
                    || addresses_changed
                    || trigger == Trigger::Event
                    || entry.last_failure.as_ref().is_none_or(FailureRecord::is_retryable)
            }
        };

        let cert_retry_allowed = trigger == Trigger::Event
            || certificates::automatic_retry_allowed(entry.certificate.as_ref());
        let certificate = if cert_retry_allowed {
            certificates::plan(entry.certificate.as_ref(), policy, now)
        } else {
            CertificateAction::None
        };

        if needs_record {
            let reason = if entry.record_state == RecordState::Absent {
                TaskReason::Create
            } else {
                TaskReason::Update
            };
            self.dispatch(hostname, reason, addresses.clone(), certificate);
        } else if !certificate.is_none() {
            self.dispatch(hostname, TaskReason::CertRenew, BTreeSet::new(), certificate);
        } else {
            debug!(hostname = %hostname, state = entry.record_state.as_str(), "Hostname already converging");
        }
    }

    fn release(&mut self, hostname: &str, service_id: &str) {
        let Some(entry) = self.store.get_mut(hostname) else {
            return;
        };
        if !entry.is_owned_by(service_id) {
            return;
        }
        entry.owning_service_id = None;

        if entry.record_state == RecordState::Absent {
            debug!(hostname = %hostname, "Released hostname was never applied, dropping");
            self.store.remove(hostname);
            return;
        }

        info!(hostname = %hostname, service_id = %service_id, "Hostname released, scheduling removal");
        self.dispatch(hostname, TaskReason::Remove, BTreeSet::new(), CertificateAction::None);
    }

    fn dispatch(
        &mut self,
        hostname: &str,
        reason: TaskReason,
        desired_addresses: BTreeSet<IpAddr>,
        certificate: CertificateAction,
    ) {
        let Some(entry) = self.store.get_mut(hostname) else {
            return;
        };

        if reason.touches_record() {
            self.next_generation += 1;
            entry.generation = self.next_generation;
            entry.record_state = RecordState::Pending;
            entry.desired_addresses.clone_from(&desired_addresses);
        }
        if !certificate.is_none() {
            certificates::mark_requested(&mut entry.certificate, hostname);
        }
        entry.updated_at = Utc::now();

        let task = ReconciliationTask {
            hostname: hostname.to_string(),
            desired_addresses,
            reason,
            generation: entry.generation,
            certificate,
        };
        debug!(
            hostname = %hostname,
            reason = reason.as_str(),
            generation = task.generation,
            certificate = ?certificate,
            "Dispatching task"
        );

        let token = self.locks.token(hostname);
        let handle = self
            .tasks
            .spawn(tasks::execute(Arc::clone(&self.ctx), task.clone(), token));
        self.in_flight.insert(
            handle.id(),
            InFlight {
                hostname: task.hostname,
                generation: task.generation,
                reason,
            },
        );
    }

    fn on_joined(&mut self, joined: Result<(Id, TaskReport), JoinError>) {
        match joined {
            Ok((id, report)) => {
                self.in_flight.remove(&id);
                self.apply_report(report);
            }
            Err(e) => {
                let Some(lost) = self.in_flight.remove(&e.id()) else {
                    error!(error = %e, "Unknown reconciliation task failed");
                    return;
                };
                error!(
                    hostname = %lost.hostname,
                    reason = lost.reason.as_str(),
                    error = %e,
                    "Reconciliation task aborted"
                );
                let threshold = self.ctx.certificates.renew_threshold;
                if let Some(entry) = self.store.get_mut(&lost.hostname) {
                    if lost.reason.touches_record() && entry.generation == lost.generation {
                        entry.record_state = RecordState::Failed;
                        entry.last_failure = Some(FailureRecord::new(
                            FailureClass::Retryable,
                            e.to_string(),
                            0,
                        ));
                    }
                    if let Some(cert) = entry.certificate.as_mut() {
                        if cert.status == CertificateStatus::Requested {
                            cert.settle(Utc::now(), threshold);
                        }
                    }
                }
            }
        }
        self.locks.prune();
    }

    fn apply_report(&mut self, report: TaskReport) {
        let TaskReport {
            task,
            record,
            certificate,
            ..
        } = report;
        let hostname = task.hostname.as_str();
        let now = Utc::now();

        let Some(entry) = self.store.get_mut(hostname) else {
            // Released and dropped while the task ran; anything it wrote is orphaned.
            if matches!(
                certificate,
                CertificateOutcome::Issued(_) | CertificateOutcome::Adopted(_)
            ) {
                self.retired.insert(task.hostname.clone());
            }
            return;
        };

        let current = task.reason.touches_record() && entry.generation == task.generation;
        let mut removed = false;

        match record {
            RecordOutcome::NotAttempted => {}
            _ if !current => {
                debug!(
                    hostname = %hostname,
                    generation = task.generation,
                    current_generation = entry.generation,
                    "Stale task report, record state left to the newer task"
                );
            }
            RecordOutcome::Applied(_) => {
                entry.record_state = RecordState::Applied;
                entry.target_addresses.clone_from(&task.desired_addresses);
                entry.last_failure = None;
                entry.updated_at = now;
            }
            RecordOutcome::Removed(_) => removed = true,
            RecordOutcome::Failed(failure) => {
                error!(
                    hostname = %hostname,
                    reason = task.reason.as_str(),
                    class = failure.class.as_str(),
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Hostname failed, needs operator attention"
                );
                entry.record_state = RecordState::Failed;
                entry.last_failure = Some(failure);
                entry.updated_at = now;
            }
        }

        if removed {
            info!(hostname = %hostname, "Hostname removed");
            let had_certificate = entry
                .certificate
                .as_ref()
                .is_some_and(|c| c.has_material())
                || matches!(
                    certificate,
                    CertificateOutcome::Issued(_) | CertificateOutcome::Adopted(_)
                );
            self.store.remove(hostname);
            if had_certificate {
                self.retired.insert(task.hostname.clone());
                self.certificates_dirty = true;
            }
            return;
        }

        if certificates::apply_outcome(
            &mut entry.certificate,
            hostname,
            certificate,
            &self.ctx.certificates,
            now,
        ) {
            // The previous pair goes once the new one is published.
            self.certificates_dirty = true;
            self.retired.insert(task.hostname.clone());
        }
    }

    /// Rewrite the proxy configuration and delete retired material.
    ///
    /// Material of new certificates was stored by the tasks, so the configuration
    /// written here only references files that are complete. Superseded and released
    /// pairs are deleted after the configuration stops referencing them. A hostname
    /// with a task still running keeps its files until that task has reported, since
    /// the task may be writing a new pair.
    async fn publish_certificates(&mut self) {
        if !self.certificates_dirty && self.retired.is_empty() {
            return;
        }

        if self.certificates_dirty {
            let served: Vec<ServedCertificate> = self
                .store
                .iter()
                .filter(|e| !e.is_released())
                .filter_map(|e| {
                    let cert = e.certificate.as_ref().filter(|c| c.has_material())?;
                    Some(ServedCertificate::new(&e.name, cert.serial.as_deref()?))
                })
                .collect();

            if let Err(e) = self.ctx.publisher.publish(&served).await {
                error!(error = %e, "Failed to publish proxy configuration, will retry");
                return;
            }
            self.certificates_dirty = false;
        }

        let retired = std::mem::take(&mut self.retired);
        for hostname in retired {
            if self.in_flight.values().any(|t| t.hostname == hostname) {
                self.retired.insert(hostname);
                continue;
            }
            let keep = self
                .store
                .get(&hostname)
                .and_then(|e| e.certificate.as_ref())
                .and_then(|c| c.serial.clone());
            if let Err(e) = self.ctx.publisher.retire(&hostname, keep.as_deref()).await {
                warn!(hostname = %hostname, error = %e, "Failed to delete certificate material");
                self.retired.insert(hostname);
            }
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.store.snapshot();
        metrics::observe_snapshot(&snapshot);
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
