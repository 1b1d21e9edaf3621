// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation tasks: the unit of work the engine dispatches per hostname.
//!
//! A task converges one hostname's DNS record (upsert or delete) and, when planned,
//! its certificate. It runs on its own tokio task under the hostname's
//! [`HostnameToken`], never touches the state store, and reports back with a
//! [`TaskReport`] that the engine folds into the store on its loop.

use super::certificates::{self, CertificateAction, CertificateOutcome};
use super::locks::HostnameToken;
use super::retry::retry_directory_call;
use crate::context::Context;
use crate::directory::RecordChange;
use crate::metrics;
use crate::state::FailureRecord;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why a task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskReason {
    /// Hostname newly claimed
    Create,
    /// Addresses or owner changed, or a failed hostname is retried
    Update,
    /// Hostname released by its owner
    Remove,
    /// Certificate work only; the record is left alone
    CertRenew,
}

impl TaskReason {
    /// Metric/log label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::CertRenew => "cert_renew",
        }
    }

    /// Whether the task changes the DNS record.
    #[must_use]
    pub fn touches_record(self) -> bool {
        !matches!(self, Self::CertRenew)
    }
}

/// One unit of work for one hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    /// Fully-qualified hostname
    pub hostname: String,
    /// Addresses to converge to; empty for removals
    pub desired_addresses: BTreeSet<IpAddr>,
    /// Why the task exists
    pub reason: TaskReason,
    /// Hostname generation at dispatch
    pub generation: u64,
    /// Certificate work to do after the record
    pub certificate: CertificateAction,
}

/// Outcome of the record half of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The task does not touch the record
    NotAttempted,
    /// The record now holds the desired addresses
    Applied(RecordChange),
    /// The record is gone
    Removed(RecordChange),
    /// The record operation failed for good
    Failed(FailureRecord),
}

/// What a finished task reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// The task as dispatched
    pub task: ReconciliationTask,
    /// Record result
    pub record: RecordOutcome,
    /// Certificate result
    pub certificate: CertificateOutcome,
    /// Wall time, waiting for the token excluded
    pub duration: Duration,
}

impl TaskReport {
    /// `success`, `failed` or `skipped`, for metrics.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match (&self.record, &self.certificate) {
            (RecordOutcome::Failed(_), _) | (_, CertificateOutcome::Failed(_)) => "failed",
            (RecordOutcome::NotAttempted, CertificateOutcome::NotRequested) => "skipped",
            _ => "success",
        }
    }
}

/// Run `task` to completion.
///
/// Waits for the hostname's turn, applies the record change with retries, then does
/// the planned certificate work. The certificate is attempted whatever the record
/// outcome; DNS and certificate failures are reported separately.
pub async fn execute(ctx: Arc<Context>, task: ReconciliationTask, mut token: HostnameToken) -> TaskReport {
    token.acquire().await;
    let start = Instant::now();
    let hostname = task.hostname.as_str();

    debug!(
        hostname = %hostname,
        reason = task.reason.as_str(),
        generation = task.generation,
        "Running reconciliation task"
    );

    let record = match task.reason {
        TaskReason::CertRenew => RecordOutcome::NotAttempted,
        TaskReason::Remove => {
            let attempted = retry_directory_call(&ctx.retry, "delete_record", hostname, || {
                ctx.directory.delete_record(hostname)
            })
            .await;
            match attempted.result {
                Ok(change) => RecordOutcome::Removed(change),
                Err(e) => RecordOutcome::Failed(FailureRecord::new(
                    e.class(),
                    e.to_string(),
                    attempted.attempts,
                )),
            }
        }
        TaskReason::Create | TaskReason::Update => {
            let addresses = &task.desired_addresses;
            let attempted = retry_directory_call(&ctx.retry, "upsert_record", hostname, || {
                ctx.directory.upsert_record(hostname, addresses)
            })
            .await;
            match attempted.result {
                Ok(change) => RecordOutcome::Applied(change),
                Err(e) => RecordOutcome::Failed(FailureRecord::new(
                    e.class(),
                    e.to_string(),
                    attempted.attempts,
                )),
            }
        }
    };

    if let RecordOutcome::Applied(change) | RecordOutcome::Removed(change) = &record {
        metrics::record_record_applied(change.as_str());
        if change.is_write() {
            info!(
                hostname = %hostname,
                change = change.as_str(),
                addresses = ?task.desired_addresses,
                "DNS record converged"
            );
        }
    }

    let certificate = certificates::obtain(&ctx, hostname, task.certificate).await;

    let report = TaskReport {
        record,
        certificate,
        duration: start.elapsed(),
        task,
    };
    metrics::record_reconciliation(report.task.reason.as_str(), report.status(), report.duration);
    report
}
