// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-process directory.
//!
//! `MemoryDirectory` keeps records and certificates in memory and issues self-signed
//! certificates. It backs `--dry-run`, where the engine watches the real cluster but
//! must not touch the directory service, and it is the directory used by the engine
//! tests: every call is counted and failures can be scripted per operation and hostname.

use super::{
    csr, CertResult, CertStatusResult, CertificateInfo, CertificateMaterial, DirectoryClient,
    IssuedCertificate, RecordChange, RecordResult,
};
use crate::directory_errors::DirectoryError;
use crate::extractor::in_zone;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Directory operations, for call accounting and failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    UpsertRecord,
    DeleteRecord,
    RequestCertificate,
    GetCertificateStatus,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpsertRecord => "upsert_record",
            Self::DeleteRecord => "delete_record",
            Self::RequestCertificate => "request_certificate",
            Self::GetCertificateStatus => "get_certificate_status",
        }
    }
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, BTreeSet<IpAddr>>,
    certificates: BTreeMap<String, Vec<CertificateInfo>>,
    calls: HashMap<Operation, u32>,
    record_writes: u32,
    in_flight: HashMap<String, u32>,
    overlaps: u32,
    scripted: HashMap<(Operation, String), VecDeque<DirectoryError>>,
    next_serial: u64,
}

/// In-memory [`DirectoryClient`].
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
    zone: Option<String>,
    latency: Duration,
}

impl MemoryDirectory {
    /// An empty directory accepting any hostname.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject hostnames outside `zone` as invalid, like the real directory.
    #[must_use]
    pub fn with_zone(mut self, zone: &str) -> Self {
        self.zone = Some(zone.to_string());
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next calls of `operation` for `hostname` fail, one error per call, in order.
    pub async fn script_failures(
        &self,
        operation: Operation,
        hostname: &str,
        errors: impl IntoIterator<Item = DirectoryError>,
    ) {
        self.inner
            .lock()
            .await
            .scripted
            .entry((operation, hostname.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Pre-populate a CA certificate.
    pub async fn seed_certificate(&self, hostname: &str, info: CertificateInfo) {
        self.inner
            .lock()
            .await
            .certificates
            .entry(hostname.to_string())
            .or_default()
            .push(info);
    }

    /// Calls made for `operation`, failed ones included.
    pub async fn calls(&self, operation: Operation) -> u32 {
        self.inner
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Record calls that changed the directory.
    pub async fn record_writes(&self) -> u32 {
        self.inner.lock().await.record_writes
    }

    /// Times a call started while another call for the same hostname was running.
    pub async fn overlaps(&self) -> u32 {
        self.inner.lock().await.overlaps
    }

    /// Addresses currently held for `hostname`.
    pub async fn record(&self, hostname: &str) -> Option<BTreeSet<IpAddr>> {
        self.inner.lock().await.records.get(hostname).cloned()
    }

    /// Every record.
    pub async fn records(&self) -> BTreeMap<String, BTreeSet<IpAddr>> {
        self.inner.lock().await.records.clone()
    }

    /// Certificates issued or seeded for `hostname`.
    pub async fn certificates(&self, hostname: &str) -> Vec<CertificateInfo> {
        self.inner
            .lock()
            .await
            .certificates
            .get(hostname)
            .cloned()
            .unwrap_or_default()
    }

    /// Count the call, simulate latency, then apply scripted failures and zone checks.
    async fn enter(&self, operation: Operation, hostname: &str) -> Result<(), DirectoryError> {
        {
            let mut inner = self.inner.lock().await;
            *inner.calls.entry(operation).or_default() += 1;
            let running = {
                let count = inner.in_flight.entry(hostname.to_string()).or_default();
                *count += 1;
                *count
            };
            if running > 1 {
                inner.overlaps += 1;
            }
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.in_flight.get_mut(hostname) {
            *running = running.saturating_sub(1);
        }
        if let Some(err) = inner
            .scripted
            .get_mut(&(operation, hostname.to_string()))
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if let Some(zone) = &self.zone {
            if !in_zone(hostname, zone) {
                return Err(DirectoryError::InvalidHostname {
                    hostname: hostname.to_string(),
                    reason: format!("outside zone {zone}"),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn upsert_record(&self, hostname: &str, addresses: &BTreeSet<IpAddr>) -> RecordResult {
        self.enter(Operation::UpsertRecord, hostname).await?;
        let mut inner = self.inner.lock().await;
        let change = match inner.records.get(hostname) {
            Some(current) if current == addresses => return Ok(RecordChange::Unchanged),
            Some(_) => RecordChange::Updated,
            None => RecordChange::Created,
        };
        inner.records.insert(hostname.to_string(), addresses.clone());
        inner.record_writes += 1;
        info!(hostname = %hostname, addresses = ?addresses, "dry-run: record {}", change.as_str());
        Ok(change)
    }

    async fn delete_record(&self, hostname: &str) -> RecordResult {
        self.enter(Operation::DeleteRecord, hostname).await?;
        let mut inner = self.inner.lock().await;
        if inner.records.remove(hostname).is_none() {
            return Ok(RecordChange::Absent);
        }
        inner.record_writes += 1;
        info!(hostname = %hostname, "dry-run: record deleted");
        Ok(RecordChange::Deleted)
    }

    async fn request_certificate(&self, hostname: &str, validity_days: u32) -> CertResult {
        self.enter(Operation::RequestCertificate, hostname).await?;

        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(i64::from(validity_days));
        let (certificate_pem, private_key_pem) = csr::self_signed(hostname, not_before, not_after)
            .map_err(|e| DirectoryError::CertificateRequest {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            })?;

        let mut inner = self.inner.lock().await;
        inner.next_serial += 1;
        let info = CertificateInfo {
            serial: inner.next_serial.to_string(),
            not_before: Some(not_before),
            not_after,
        };
        inner
            .certificates
            .entry(hostname.to_string())
            .or_default()
            .push(info.clone());
        info!(hostname = %hostname, serial = %info.serial, "dry-run: self-signed certificate issued");

        Ok(IssuedCertificate {
            info,
            material: CertificateMaterial {
                certificate_pem,
                private_key_pem,
            },
        })
    }

    async fn get_certificate_status(&self, hostname: &str) -> CertStatusResult {
        self.enter(Operation::GetCertificateStatus, hostname).await?;
        Ok(self
            .inner
            .lock()
            .await
            .certificates
            .get(hostname)
            .and_then(|certs| certs.iter().max_by_key(|c| c.not_after))
            .cloned())
    }
}
