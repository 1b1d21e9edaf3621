// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory record of what dnsync last applied.
//!
//! The [`StateStore`] is owned by the reconciliation engine and mutated only from its
//! event loop, so it needs no locking. Everything else sees it through
//! [`StateStore::snapshot`], which returns owned copies.

use crate::directory_errors::FailureClass;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// DNS record convergence state of one hostname.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Not present in the directory
    #[default]
    Absent,
    /// A task is in flight
    Pending,
    /// The directory matches the desired addresses
    Applied,
    /// The last task failed; see `last_failure`
    Failed,
}

impl RecordState {
    /// Metric/log label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

/// Certificate lifecycle state of one hostname.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// No certificate has been obtained
    #[default]
    None,
    /// Issuance is in flight
    Requested,
    /// Serving a certificate outside the renew window
    Valid,
    /// Serving a certificate inside the renew window
    ExpiringSoon,
    /// The last issuance attempt failed
    Failed,
}

/// Certificate tracked for a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    /// Hostname the certificate is for
    pub hostname: String,
    /// Expiry of the certificate currently on disk
    pub not_after: Option<DateTime<Utc>>,
    /// Issuance time of the certificate currently on disk
    pub issued_at: Option<DateTime<Utc>>,
    /// CA serial number of the certificate currently on disk
    pub serial: Option<String>,
    /// Lifecycle status
    pub status: CertificateStatus,
    /// Details of the last issuance failure
    pub failure: Option<FailureRecord>,
}

impl CertificateRecord {
    /// An empty record for `hostname`.
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            not_after: None,
            issued_at: None,
            serial: None,
            status: CertificateStatus::None,
            failure: None,
        }
    }

    /// Whether certificate material is on disk and serving.
    #[must_use]
    pub fn has_material(&self) -> bool {
        self.not_after.is_some()
    }

    /// Whether the serving certificate is inside the renew window.
    ///
    /// `not_after - now <= threshold`. A record without material is never "within" it.
    #[must_use]
    pub fn within_renew_window(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.not_after
            .is_some_and(|not_after| not_after - now <= threshold)
    }

    /// Move `Valid` to `ExpiringSoon` once the renew window is reached.
    ///
    /// Returns `true` if the status changed.
    pub fn refresh_status(&mut self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        if self.status == CertificateStatus::Valid && self.within_renew_window(now, threshold) {
            self.status = CertificateStatus::ExpiringSoon;
            return true;
        }
        false
    }

    /// Recompute the status from the material alone, dropping any in-flight marker.
    pub fn settle(&mut self, now: DateTime<Utc>, threshold: chrono::Duration) {
        self.status = if !self.has_material() {
            CertificateStatus::None
        } else if self.within_renew_window(now, threshold) {
            CertificateStatus::ExpiringSoon
        } else {
            CertificateStatus::Valid
        };
    }
}

/// Why a hostname is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Retryable-exhausted or permanent
    pub class: FailureClass,
    /// Error text of the last attempt
    pub message: String,
    /// Attempts made by the failing task
    pub attempts: u32,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    /// A failure recorded now.
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            class,
            message: message.into(),
            attempts,
            at: Utc::now(),
        }
    }

    /// Whether a later resync may try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class == FailureClass::Retryable
    }
}

/// One DNS name under management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedHostname {
    /// Fully-qualified hostname (unique key)
    pub name: String,
    /// Service currently claiming the hostname; `None` once released for removal
    pub owning_service_id: Option<String>,
    /// Display name of the owning service
    pub service_name: String,
    /// Catalog category
    pub category: String,
    /// Catalog description
    pub description: String,
    /// Addresses last applied to the directory
    pub target_addresses: BTreeSet<IpAddr>,
    /// Addresses the latest dispatched task converges to
    pub desired_addresses: BTreeSet<IpAddr>,
    /// Record convergence state
    pub record_state: RecordState,
    /// Details of the last record failure
    pub last_failure: Option<FailureRecord>,
    /// Certificate, when automation has touched this hostname
    pub certificate: Option<CertificateRecord>,
    /// Bumped on every task dispatch; stale task reports are recognised by it
    pub generation: u64,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl ManagedHostname {
    /// A fresh, absent entry.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            owning_service_id: None,
            service_name: String::new(),
            category: String::new(),
            description: String::new(),
            target_addresses: BTreeSet::new(),
            desired_addresses: BTreeSet::new(),
            record_state: RecordState::Absent,
            last_failure: None,
            certificate: None,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether the entry has been released and awaits deletion.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.owning_service_id.is_none()
    }

    /// Whether `service_id` currently owns the entry.
    #[must_use]
    pub fn is_owned_by(&self, service_id: &str) -> bool {
        self.owning_service_id.as_deref() == Some(service_id)
    }

    /// Certificate status, `None` when no record exists.
    #[must_use]
    pub fn certificate_status(&self) -> CertificateStatus {
        self.certificate
            .as_ref()
            .map_or(CertificateStatus::None, |c| c.status)
    }
}

/// Read-only copy of one hostname, handed to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostnameSnapshot {
    /// Fully-qualified hostname
    pub name: String,
    /// Owning service id
    pub service_id: String,
    /// Owning service display name
    pub service_name: String,
    /// Catalog category
    pub category: String,
    /// Catalog description
    pub description: String,
    /// Addresses last applied
    pub target_addresses: Vec<IpAddr>,
    /// Record state
    pub record_state: RecordState,
    /// Certificate status
    pub certificate_status: CertificateStatus,
    /// Certificate expiry, if one is serving
    pub certificate_not_after: Option<DateTime<Utc>>,
    /// Last failure text, for operator attention
    pub last_error: Option<String>,
}

/// Point-in-time copy of every owned hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Entries sorted by hostname
    pub hostnames: Vec<HostnameSnapshot>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            hostnames: Vec::new(),
        }
    }
}

impl StoreSnapshot {
    /// Count entries per record state.
    #[must_use]
    pub fn count_by_state(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.hostnames {
            *counts.entry(entry.record_state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Map from hostname to its last-known state.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    entries: BTreeMap<String, ManagedHostname>,
}

impl StateStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a hostname.
    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<&ManagedHostname> {
        self.entries.get(hostname)
    }

    /// Look up a hostname for mutation.
    pub fn get_mut(&mut self, hostname: &str) -> Option<&mut ManagedHostname> {
        self.entries.get_mut(hostname)
    }

    /// Fetch or create the entry for `hostname`.
    pub fn entry(&mut self, hostname: &str) -> &mut ManagedHostname {
        self.entries
            .entry(hostname.to_string())
            .or_insert_with(|| ManagedHostname::new(hostname))
    }

    /// Drop a hostname entirely.
    pub fn remove(&mut self, hostname: &str) -> Option<ManagedHostname> {
        self.entries.remove(hostname)
    }

    /// Number of tracked hostnames, released ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in hostname order.
    pub fn iter(&self) -> impl Iterator<Item = &ManagedHostname> {
        self.entries.values()
    }

    /// Iterate entries mutably in hostname order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagedHostname> {
        self.entries.values_mut()
    }

    /// Hostnames currently owned by `service_id`.
    #[must_use]
    pub fn owned_by(&self, service_id: &str) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.is_owned_by(service_id))
            .map(|e| e.name.clone())
            .collect()
    }

    /// Every service id that owns at least one hostname.
    #[must_use]
    pub fn owners(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter_map(|e| e.owning_service_id.clone())
            .collect()
    }

    /// Owned copy of all owned hostnames; released entries are left out.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let hostnames = self
            .entries
            .values()
            .filter_map(|e| {
                let service_id = e.owning_service_id.clone()?;
                Some(HostnameSnapshot {
                    name: e.name.clone(),
                    service_id,
                    service_name: e.service_name.clone(),
                    category: e.category.clone(),
                    description: e.description.clone(),
                    target_addresses: e.target_addresses.iter().copied().collect(),
                    record_state: e.record_state,
                    certificate_status: e.certificate_status(),
                    certificate_not_after: e.certificate.as_ref().and_then(|c| c.not_after),
                    last_error: e
                        .last_failure
                        .as_ref()
                        .or_else(|| e.certificate.as_ref().and_then(|c| c.failure.as_ref()))
                        .map(|f| f.message.clone()),
                })
            })
            .collect();
        StoreSnapshot {
            taken_at: Utc::now(),
            hostnames,
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod state_tests;
