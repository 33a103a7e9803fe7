//! # Controller Metrics
//!
//! Metrics for controller operations: reconciliations, requeues, coalescing,
//! per-step failures and teardowns.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec};
use std::sync::LazyLock;

// Reconciliation metrics
static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cluster_infra_reconciliations_total",
        "Total number of convergence passes",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cluster_infra_reconciliation_errors_total",
        "Total number of convergence passes that returned an error",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "cluster_infra_reconciliation_duration_seconds",
            "Duration of a convergence pass in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

// Requeue metrics
static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "cluster_infra_requeues_total",
            "Total number of reconciliation requeues",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static COALESCED_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cluster_infra_coalesced_requests_total",
        "Total number of requests skipped by the coalescing cooldown",
    )
    .expect("Failed to create COALESCED_REQUESTS_TOTAL metric - this should never happen")
});

static STEP_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "cluster_infra_step_failures_total",
            "Total number of failed ensure or teardown steps",
        ),
        &["step"],
    )
    .expect("Failed to create STEP_FAILURES_TOTAL metric - this should never happen")
});

static TEARDOWNS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cluster_infra_teardowns_total",
        "Total number of completed teardowns (finalizer removed)",
    )
    .expect("Failed to create TEARDOWNS_TOTAL metric - this should never happen")
});

/// Register controller metrics with the registry
pub(crate) fn register_controller_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COALESCED_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STEP_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TEARDOWNS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_coalesced_requests() {
    COALESCED_REQUESTS_TOTAL.inc();
}

pub fn increment_step_failures(step: &str) {
    STEP_FAILURES_TOTAL.with_label_values(&[step]).inc();
}

pub fn increment_teardowns() {
    TEARDOWNS_TOTAL.inc();
}
