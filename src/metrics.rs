// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for dnsync.
//!
//! All metrics carry the `dnsync_` prefix and live in [`METRICS_REGISTRY`], which the
//! catalog server exposes at `/metrics`.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - Tasks run by the engine and their outcomes
//! - **Directory Metrics** - Calls to the directory service and what they changed
//! - **Certificate Metrics** - Issuance activity
//! - **State Metrics** - Managed hostnames per record state
//!
//! # Example
//!
//! ```rust,no_run
//! use dnsync::metrics::record_reconciliation;
//!
//! record_reconciliation("create", "success", std::time::Duration::from_millis(40));
//! ```

use crate::constants::METRICS_NAMESPACE;
use crate::state::{RecordState, StoreSnapshot};
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

// ============================================================================
// Global Metrics Registry
// ============================================================================

/// Global Prometheus metrics registry
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliation tasks by kind and status
///
/// Labels:
/// - `kind`: Task reason (`create`, `update`, `remove`, `cert_renew`)
/// - `status`: Outcome (`success`, `failed`, `skipped`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliation tasks by kind and status",
    );
    let counter = CounterVec::new(opts, &["kind", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliation tasks in seconds, retries included
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliation tasks in seconds by kind",
    )
    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]);
    let histogram = HistogramVec::new(opts, &["kind"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Hostnames claimed by a new service while owned by another
pub static OWNERSHIP_CONFLICTS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    let counter = Counter::new(
        format!("{METRICS_NAMESPACE}_ownership_conflicts_total"),
        "Hostnames re-owned by a different service",
    )
    .unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Malformed or rejected hostname declarations
pub static EXTRACTION_WARNINGS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    let counter = Counter::new(
        format!("{METRICS_NAMESPACE}_extraction_warnings_total"),
        "Hostname declarations skipped during extraction",
    )
    .unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Directory Metrics
// ============================================================================

/// Directory calls by operation and outcome
///
/// Labels:
/// - `operation`: e.g. `upsert_record`, `request_certificate`
/// - `outcome`: `success`, `retryable`, `permanent`
pub static DIRECTORY_CALLS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_directory_calls_total"),
        "Directory service calls by operation and outcome",
    );
    let counter = CounterVec::new(opts, &["operation", "outcome"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Successful record operations by what they changed
pub static RECORDS_APPLIED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_records_applied_total"),
        "Successful record operations by change",
    );
    let counter = CounterVec::new(opts, &["change"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Certificate Metrics
// ============================================================================

/// Certificates obtained from the CA
pub static CERTIFICATES_ISSUED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    let counter = Counter::new(
        format!("{METRICS_NAMESPACE}_certificates_issued_total"),
        "Certificates issued by the directory CA",
    )
    .unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// State Metrics
// ============================================================================

/// Owned hostnames by record state
pub static MANAGED_HOSTNAMES: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_managed_hostnames"),
        "Managed hostnames by record state",
    );
    let gauge = GaugeVec::new(opts, &["state"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(gauge.clone()))
        .unwrap();
    gauge
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a finished reconciliation task
///
/// # Arguments
/// * `kind` - Task reason
/// * `status` - `success`, `failed` or `skipped`
/// * `duration` - Wall time of the task, retries included
pub fn record_reconciliation(kind: &str, status: &str, duration: Duration) {
    RECONCILIATION_TOTAL.with_label_values(&[kind, status]).inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

/// Record one directory call attempt
pub fn record_directory_call(operation: &str, outcome: &str) {
    DIRECTORY_CALLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Record a successful record operation
pub fn record_record_applied(change: &str) {
    RECORDS_APPLIED_TOTAL.with_label_values(&[change]).inc();
}

/// Record an issued certificate
pub fn record_certificate_issued() {
    CERTIFICATES_ISSUED_TOTAL.inc();
}

/// Record an ownership conflict
pub fn record_ownership_conflict() {
    OWNERSHIP_CONFLICTS_TOTAL.inc();
}

/// Record extraction warnings
pub fn record_extraction_warnings(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    EXTRACTION_WARNINGS_TOTAL.inc_by(count as f64);
}

/// Refresh the per-state hostname gauge from a snapshot
pub fn observe_snapshot(snapshot: &StoreSnapshot) {
    let counts = snapshot.count_by_state();
    for state in [
        RecordState::Absent,
        RecordState::Pending,
        RecordState::Applied,
        RecordState::Failed,
    ] {
        let label = state.as_str();
        #[allow(clippy::cast_precision_loss)]
        MANAGED_HOSTNAMES
            .with_label_values(&[label])
            .set(counts.get(label).copied().unwrap_or(0) as f64);
    }
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    #[test]
    fn test_record_reconciliation() {
        record_reconciliation("test_kind", "success", Duration::from_millis(500));

        let counter = RECONCILIATION_TOTAL.with_label_values(&["test_kind", "success"]);
        assert!(counter.get() > 0.0);

        let histogram = RECONCILIATION_DURATION_SECONDS.with_label_values(&["test_kind"]);
        assert!(histogram.get_sample_count() > 0);
    }

    #[test]
    fn test_observe_snapshot_sets_every_state() {
        let mut store = StateStore::new();
        let entry = store.entry("gauge-test.example.com");
        entry.owning_service_id = Some("default/gauge".to_string());
        entry.record_state = RecordState::Applied;

        observe_snapshot(&store.snapshot());
        assert!(MANAGED_HOSTNAMES.with_label_values(&["applied"]).get() >= 1.0);
        assert!(MANAGED_HOSTNAMES.with_label_values(&["failed"]).get() >= 0.0);
    }

    #[test]
    fn test_gather_metrics() {
        record_directory_call("gather_test", "success");
        record_ownership_conflict();

        let metrics_text = gather_metrics().expect("Gathering metrics should succeed");
        assert!(
            metrics_text.contains("dnsync_directory_calls_total"),
            "Metrics should contain the directory call counter"
        );
        assert!(metrics_text.contains("dnsync_ownership_conflicts_total"));
    }
}
