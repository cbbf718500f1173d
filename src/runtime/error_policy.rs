//! # Error Policy
//!
//! Metrics and retry policy around every reconcile.
//!
//! A failed reconcile is retried with a per-object Fibonacci backoff; a
//! successful one clears that object's backoff. A conflicting write is
//! retried right away with a fresh read.

use crate::constants::IMMEDIATE_REQUEUE_MS;
use crate::controller::backoff::BackoffRegistry;
use crate::controller::reconciler::{Outcome, Reconciler, ReconcilerError};
use crate::controller::store::ObjectStore;
use crate::observability::metrics;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, Instrument};

/// Backoff key of an object within a controller.
#[must_use]
pub fn resource_key(controller: &str, namespace: &str, name: &str) -> String {
    format!("{controller}/{namespace}/{name}")
}

/// Run one reconcile inside a span, recording count, duration and requeues.
///
/// # Errors
///
/// Whatever `reconcile` returns.
pub async fn instrumented<S, F>(
    controller: &'static str,
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
    reconcile: F,
) -> Result<Outcome, ReconcilerError>
where
    S: ObjectStore,
    F: Future<Output = Result<Outcome, ReconcilerError>>,
{
    let span = tracing::info_span!(
        "controller.reconcile",
        controller,
        resource.namespace = namespace,
        resource.name = name
    );
    metrics::increment_reconciliations(controller);
    let start = Instant::now();
    let result = reconcile.instrument(span).await;
    metrics::observe_reconciliation_duration(controller, start.elapsed().as_secs_f64());

    if let Ok(outcome) = &result {
        ctx.backoff.reset(&resource_key(controller, namespace, name));
        if *outcome != Outcome::Done {
            metrics::increment_requeues(controller, outcome.as_str());
        }
    }
    result
}

/// Delay before retrying a failed reconcile of `namespace/name`.
pub fn retry_delay(
    controller: &'static str,
    backoff: &BackoffRegistry,
    namespace: &str,
    name: &str,
    error: &ReconcilerError,
) -> Duration {
    let error_span = tracing::error_span!(
        "controller.reconciliation_error",
        controller,
        resource.namespace = namespace,
        resource.name = name,
        error = %error
    );
    let _guard = error_span.enter();

    // A vanished object is re-read once and then dropped by the reconciler.
    if error.is_not_found() {
        debug!("Object vanished mid-reconcile: {error}");
        metrics::increment_requeues(controller, "not-found");
        return Duration::from_millis(IMMEDIATE_REQUEUE_MS);
    }
    metrics::increment_reconciliation_errors(controller);

    if error.is_conflict() {
        metrics::increment_requeues(controller, "conflict");
        return Duration::from_millis(IMMEDIATE_REQUEUE_MS);
    }

    error!("Reconciliation failed: {error}");
    let (delay, error_count) = backoff.next_failure(&resource_key(controller, namespace, name));
    let next = chrono::Utc::now() + chrono::Duration::seconds(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX));
    info!(
        backoff_secs = delay.as_secs(),
        error_count,
        next_retry = %next.to_rfc3339(),
        "Retrying with Fibonacci backoff"
    );
    metrics::increment_requeues(controller, "error-backoff");
    delay
}

/// `error_policy` for the kube-runtime controllers.
pub fn handle_reconciliation_error<K, S>(
    controller: &'static str,
    obj: &Arc<K>,
    error: &ReconcilerError,
    ctx: &Arc<Reconciler<S>>,
) -> Action
where
    K: Resource,
    S: ObjectStore,
{
    let namespace = obj.namespace().unwrap_or_default();
    Action::requeue(retry_delay(controller, &ctx.backoff, &namespace, &obj.name_any(), error))
}
