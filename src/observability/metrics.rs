//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `nim_operator_reconciliations_total` - Reconciliations by controller
//! - `nim_operator_reconciliation_errors_total` - Failed reconciliations by controller
//! - `nim_operator_reconciliation_duration_seconds` - Reconcile latency by controller
//! - `nim_operator_requeues_total` - Requeues by controller and reason
//! - `nim_operator_dependents_created_total` - Dependent resources created by kind
//! - `nim_operator_dependents_deleted_total` - Dependent resources deleted by kind
//! - `nim_operator_ngc_calls_total` - NGC API calls by operation and result
//! - `nim_operator_is_leader` - 1 while this replica holds the leader lease

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_reconciliations_total",
            "Total number of reconciliations by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_reconciliation_errors_total",
            "Total number of failed reconciliations by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "nim_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds by controller",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_requeues_total",
            "Total number of requeues by controller and reason",
        ),
        &["controller", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static DEPENDENTS_CREATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_dependents_created_total",
            "Total number of dependent resources created by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create DEPENDENTS_CREATED_TOTAL metric - this should never happen")
});

static DEPENDENTS_DELETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_dependents_deleted_total",
            "Total number of dependent resources deleted by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create DEPENDENTS_DELETED_TOTAL metric - this should never happen")
});

static NGC_CALLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nim_operator_ngc_calls_total",
            "Total number of NGC API calls by operation and result",
        ),
        &["operation", "result"],
    )
    .expect("Failed to create NGC_CALLS_TOTAL metric - this should never happen")
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "nim_operator_is_leader",
        "Whether this replica currently holds the leader lease",
    )
    .expect("Failed to create IS_LEADER metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Registration only fails on duplicate metric names"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEPENDENTS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEPENDENTS_DELETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NGC_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IS_LEADER.clone()))?;
    Ok(())
}

pub fn increment_reconciliations(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors(controller: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_requeues(controller: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).inc();
}

pub fn increment_dependents_created(kind: &str) {
    DEPENDENTS_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_dependents_deleted(kind: &str) {
    DEPENDENTS_DELETED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_ngc_calls(operation: &str, result: &str) {
    NGC_CALLS_TOTAL.with_label_values(&[operation, result]).inc();
}

pub fn set_leader(is_leader: bool) {
    IS_LEADER.set(i64::from(is_leader));
}
