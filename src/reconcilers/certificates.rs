// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Certificate lifecycle management.
//!
//! Decides when a hostname needs a certificate, obtains it, and folds the result back
//! into the hostname's [`CertificateRecord`].
//!
//! # Lifecycle
//!
//! ```text
//! None ──plan: Issue──▶ Requested ──issued/adopted──▶ Valid ──sweep──▶ ExpiringSoon
//!                           │                           ▲                  │
//!                           └──failure──▶ Failed        └──reissued◀───────┘
//! ```
//!
//! Planning happens on the engine loop when a task is dispatched (and on every sweep);
//! issuance runs inside the task under the hostname's token. Certificates converge
//! independently of DNS: a hostname whose record failed still gets its certificate
//! issued and renewed.
//!
//! Material is stored per serial (see [`crate::publisher`]). A reissue keeps the old
//! pair on disk and in the proxy configuration until the new pair has been written and
//! published, so there is never a window without a certificate.

use super::retry::retry_directory_call;
use crate::config::Config;
use crate::context::Context;
use crate::directory::CertificateInfo;
use crate::directory_errors::FailureClass;
use crate::metrics;
use crate::state::{CertificateRecord, CertificateStatus, FailureRecord, StateStore};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Certificate automation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePolicy {
    /// Issue certificates at all
    pub enabled: bool,
    /// Requested validity
    pub validity_days: u32,
    /// Reissue when this much or less validity remains
    pub renew_threshold: chrono::Duration,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
}

impl CertificatePolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.certificates.enabled,
            validity_days: config.certificates.validity_days,
            renew_threshold: config.certificates.renew_threshold(),
            sweep_interval: config.certificates.sweep_interval(),
        }
    }
}

/// What to do about a hostname's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateAction {
    /// Nothing
    None,
    /// First certificate; an existing CA certificate may be adopted
    Issue,
    /// Replace an expiring certificate with a new one
    Reissue,
}

impl CertificateAction {
    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::None
    }
}

/// Result of the certificate half of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateOutcome {
    /// The task carried no certificate work
    NotRequested,
    /// A new certificate was issued and its material stored
    Issued(CertificateInfo),
    /// The CA already held a usable certificate whose material is on disk
    Adopted(CertificateInfo),
    /// Issuance failed
    Failed(FailureRecord),
}

/// Decide what a certificate needs at `now`.
///
/// - automation disabled → nothing
/// - no certificate material → issue
/// - `notAfter − now ≤ renew threshold` → reissue
/// - an issuance already in flight → nothing
#[must_use]
pub fn plan(
    certificate: Option<&CertificateRecord>,
    policy: &CertificatePolicy,
    now: DateTime<Utc>,
) -> CertificateAction {
    if !policy.enabled {
        return CertificateAction::None;
    }
    let Some(cert) = certificate else {
        return CertificateAction::Issue;
    };
    if cert.status == CertificateStatus::Requested {
        return CertificateAction::None;
    }
    if !cert.has_material() {
        return CertificateAction::Issue;
    }
    if cert.within_renew_window(now, policy.renew_threshold) {
        CertificateAction::Reissue
    } else {
        CertificateAction::None
    }
}

/// Whether automatic triggers (resync, sweep) may retry this certificate.
///
/// A permanent issuance failure waits for a genuine event on the hostname.
#[must_use]
pub fn automatic_retry_allowed(certificate: Option<&CertificateRecord>) -> bool {
    certificate
        .and_then(|c| c.failure.as_ref())
        .is_none_or(FailureRecord::is_retryable)
}

/// Mark a planned certificate as in flight, creating the record if needed.
pub fn mark_requested(certificate: &mut Option<CertificateRecord>, hostname: &str) {
    certificate
        .get_or_insert_with(|| CertificateRecord::new(hostname))
        .status = CertificateStatus::Requested;
}

/// Carry out `action` for `hostname`. Runs inside a task, under the hostname's token.
pub async fn obtain(ctx: &Context, hostname: &str, action: CertificateAction) -> CertificateOutcome {
    match action {
        CertificateAction::None => CertificateOutcome::NotRequested,
        CertificateAction::Issue => {
            if let Some(info) = adoptable(ctx, hostname).await {
                return CertificateOutcome::Adopted(info);
            }
            issue(ctx, hostname).await
        }
        CertificateAction::Reissue => issue(ctx, hostname).await,
    }
}

/// A CA certificate that can be used as-is: outside the renew window and with its own
/// material, named by its serial, already on disk.
async fn adoptable(ctx: &Context, hostname: &str) -> Option<CertificateInfo> {
    let attempted = retry_directory_call(&ctx.retry, "get_certificate_status", hostname, || {
        ctx.directory.get_certificate_status(hostname)
    })
    .await;

    let info = match attempted.result {
        Ok(Some(info)) => info,
        Ok(None) => return None,
        Err(e) => {
            warn!(hostname = %hostname, error = %e, "Could not query existing certificate, issuing a new one");
            return None;
        }
    };

    if info.not_after - Utc::now() <= ctx.certificates.renew_threshold {
        debug!(hostname = %hostname, not_after = %info.not_after, "Existing certificate is due for renewal");
        return None;
    }
    if !ctx.publisher.has_material(hostname, &info.serial).await {
        debug!(
            hostname = %hostname,
            serial = %info.serial,
            "CA holds a certificate but its material is not on disk"
        );
        return None;
    }

    info!(
        hostname = %hostname,
        serial = %info.serial,
        not_after = %info.not_after,
        "Adopting existing certificate"
    );
    Some(info)
}

async fn issue(ctx: &Context, hostname: &str) -> CertificateOutcome {
    let validity_days = ctx.certificates.validity_days;
    let attempted = retry_directory_call(&ctx.retry, "request_certificate", hostname, || {
        ctx.directory.request_certificate(hostname, validity_days)
    })
    .await;

    let issued = match attempted.result {
        Ok(issued) => issued,
        Err(e) => {
            return CertificateOutcome::Failed(FailureRecord::new(
                e.class(),
                e.to_string(),
                attempted.attempts,
            ));
        }
    };

    if let Err(e) = ctx
        .publisher
        .store_material(hostname, &issued.info.serial, &issued.material)
        .await
    {
        error!(hostname = %hostname, error = %e, "Failed to store certificate material");
        return CertificateOutcome::Failed(FailureRecord::new(
            FailureClass::Retryable,
            e.to_string(),
            attempted.attempts,
        ));
    }

    metrics::record_certificate_issued();
    CertificateOutcome::Issued(issued.info)
}

/// Fold a task's certificate outcome into the record.
///
/// Returns `true` when the set of served certificates changed and the proxy
/// configuration must be republished.
pub fn apply_outcome(
    certificate: &mut Option<CertificateRecord>,
    hostname: &str,
    outcome: CertificateOutcome,
    policy: &CertificatePolicy,
    now: DateTime<Utc>,
) -> bool {
    match outcome {
        CertificateOutcome::NotRequested => false,
        CertificateOutcome::Issued(info) | CertificateOutcome::Adopted(info) => {
            let cert = certificate.get_or_insert_with(|| CertificateRecord::new(hostname));
            cert.not_after = Some(info.not_after);
            cert.issued_at = Some(info.not_before.unwrap_or(now));
            cert.serial = Some(info.serial);
            cert.failure = None;
            cert.settle(now, policy.renew_threshold);
            true
        }
        CertificateOutcome::Failed(failure) => {
            error!(
                hostname = %hostname,
                class = failure.class.as_str(),
                attempts = failure.attempts,
                error = %failure.message,
                "Certificate issuance failed"
            );
            let cert = certificate.get_or_insert_with(|| CertificateRecord::new(hostname));
            cert.status = CertificateStatus::Failed;
            cert.failure = Some(failure);
            false
        }
    }
}

/// Move `Valid` certificates inside the renew window to `ExpiringSoon`.
///
/// Returns the number of records that changed.
pub fn refresh_statuses(store: &mut StateStore, policy: &CertificatePolicy, now: DateTime<Utc>) -> usize {
    let mut changed = 0;
    for entry in store.iter_mut() {
        if let Some(cert) = entry.certificate.as_mut() {
            if cert.refresh_status(now, policy.renew_threshold) {
                info!(
                    hostname = %entry.name,
                    not_after = ?cert.not_after,
                    "Certificate entered renew window"
                );
                changed += 1;
            }
        }
    }
    changed
}

/// Hostnames the sweep should dispatch certificate work for.
///
/// Every owned hostname without an issuance in flight and without a permanent
/// issuance failure is considered, whatever the state of its DNS record.
#[must_use]
pub fn due_for_sweep(
    store: &StateStore,
    policy: &CertificatePolicy,
    now: DateTime<Utc>,
) -> Vec<(String, CertificateAction)> {
    store
        .iter()
        .filter(|e| !e.is_released())
        .filter(|e| automatic_retry_allowed(e.certificate.as_ref()))
        .filter_map(|e| {
            let action = plan(e.certificate.as_ref(), policy, now);
            (!action.is_none()).then(|| (e.name.clone(), action))
        })
        .collect()
}

#[cfg(test)]
#[path = "certificates_tests.rs"]
mod certificates_tests;
