//! # Types
//!
//! Core types shared by the reconcilers.

use crate::config::ControllerConfig;
use crate::controller::backoff::BackoffRegistry;
use crate::controller::ngc::{NgcApi, NgcError};
use crate::controller::store::{ObjectStore, StoreError};
use crate::controller::sync::SyncError;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("serving readiness check failed: {0}")]
    Readiness(#[source] StoreError),
    #[error(transparent)]
    Ngc(#[from] NgcError),
}

impl ReconcilerError {
    /// Whether the error is an optimistic-concurrency conflict that should be
    /// answered with an immediate requeue instead of backoff.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Store(e) | Self::Readiness(e) => e.is_conflict(),
            Self::Sync(e) => e.is_conflict(),
            Self::Ngc(_) => false,
        }
    }

    /// Whether the error is an object that vanished mid-reconcile.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) | Self::Readiness(e) | Self::Sync(SyncError::Store(e)) => e.is_not_found(),
            Self::Sync(_) | Self::Ngc(_) => false,
        }
    }
}

/// What the dispatcher should do with the key after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do until the object (or something it owns) changes
    Done,
    /// Reconcile again right away with a fresh read
    Requeue,
    /// Reconcile again after the given delay
    RequeueAfter(Duration),
}

impl Outcome {
    /// Label used for the requeue metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Requeue => "requeue",
            Outcome::RequeueAfter(_) => "requeue-after",
        }
    }

    /// Delay before the next reconcile, if any
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Outcome::Done => None,
            Outcome::Requeue => Some(Duration::from_millis(crate::constants::IMMEDIATE_REQUEUE_MS)),
            Outcome::RequeueAfter(d) => Some(*d),
        }
    }

    #[must_use]
    pub fn into_action(self) -> Action {
        self.delay().map_or_else(Action::await_change, Action::requeue)
    }
}

/// Shared reconciler context
///
/// Holds the object store, the NGC capability, configuration and per-key
/// backoff state. Shared across watch loops behind an `Arc`.
pub struct Reconciler<S> {
    pub store: S,
    pub ngc: Arc<dyn NgcApi>,
    pub config: Arc<ControllerConfig>,
    pub backoff: BackoffRegistry,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, ngc: Arc<dyn NgcApi>, config: ControllerConfig) -> Self {
        let backoff = BackoffRegistry::new(config.backoff_min_secs, config.backoff_max_secs);
        Self {
            store,
            ngc,
            config: Arc::new(config),
            backoff,
        }
    }
}

impl<S> std::fmt::Debug for Reconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Map a conflicting write to an immediate requeue; pass everything else through.
///
/// # Errors
///
/// Any non-conflict error from `result`.
pub fn requeue_on_conflict(result: Result<Outcome, ReconcilerError>) -> Result<Outcome, ReconcilerError> {
    match result {
        Err(e) if e.is_conflict() => {
            tracing::debug!(error = %e, "Conflicting write, requeueing");
            Ok(Outcome::Requeue)
        }
        other => other,
    }
}
