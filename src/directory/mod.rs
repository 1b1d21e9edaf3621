// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Directory service access: DNS records and certificates.
//!
//! The engine talks to the directory only through the [`DirectoryClient`] trait. Every
//! call either succeeds or fails with a [`DirectoryError`] whose
//! [`class`](DirectoryError::class) says whether a retry can help.
//!
//! # Implementations
//!
//! - [`freeipa::FreeIpaClient`] - FreeIPA JSON-RPC over HTTPS
//! - [`memory::MemoryDirectory`] - in-process directory used for `--dry-run`
//!
//! # Idempotence
//!
//! `upsert_record` reads before writing and returns [`RecordChange::Unchanged`] without
//! a write when the directory already holds exactly the requested addresses.
//! `delete_record` on a missing name returns [`RecordChange::Absent`]. Replaying either
//! call is therefore harmless.

pub mod csr;
pub mod freeipa;
pub mod memory;

pub use freeipa::FreeIpaClient;
pub use memory::MemoryDirectory;

use crate::directory_errors::DirectoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// What a successful record operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordChange {
    /// The name did not exist and was created
    Created,
    /// The name existed with different addresses
    Updated,
    /// The directory already matched; nothing was written
    Unchanged,
    /// The name existed and was deleted
    Deleted,
    /// The name did not exist; nothing to delete
    Absent,
}

impl RecordChange {
    /// Whether the operation wrote to the directory.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    /// Metric/log label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Absent => "absent",
        }
    }
}

/// Validity window and identity of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// CA serial number
    pub serial: String,
    /// Start of validity, when the CA reports it
    pub not_before: Option<DateTime<Utc>>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// PEM-encoded certificate and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// Leaf certificate, PEM
    pub certificate_pem: String,
    /// Private key, PEM
    pub private_key_pem: String,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate_pem", &format_args!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// A freshly issued certificate with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Serial and validity
    pub info: CertificateInfo,
    /// Certificate and key to serve
    pub material: CertificateMaterial,
}

/// Outcome of a record operation.
pub type RecordResult = Result<RecordChange, DirectoryError>;

/// Outcome of a certificate request.
pub type CertResult = Result<IssuedCertificate, DirectoryError>;

/// Outcome of a certificate status query; `None` when the CA holds no live certificate.
pub type CertStatusResult = Result<Option<CertificateInfo>, DirectoryError>;

/// Operations the reconciliation engine needs from the directory service.
///
/// Hostnames are fully-qualified and canonical (lowercase, no trailing dot).
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Make `hostname` resolve to exactly `addresses`.
    async fn upsert_record(&self, hostname: &str, addresses: &BTreeSet<IpAddr>) -> RecordResult;

    /// Remove every address record of `hostname`.
    async fn delete_record(&self, hostname: &str) -> RecordResult;

    /// Issue a new certificate for `hostname`.
    async fn request_certificate(&self, hostname: &str, validity_days: u32) -> CertResult;

    /// Latest non-revoked certificate the CA holds for `hostname`.
    async fn get_certificate_status(&self, hostname: &str) -> CertStatusResult;
}
