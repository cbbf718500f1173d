//! # Readiness Gate
//!
//! Reports whether the KServe serving subsystem is installed and ready, based
//! on the cluster's `DataScienceCluster` status.

use crate::constants::{gate_reasons, DSC_READY_PHASE, KSERVE_COMPONENT};
use crate::controller::store::{ObjectStore, StoreError};
use crate::crd::DataScienceCluster;
use tracing::debug;

/// Outcome of a readiness query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Whether KServe is installed and the cluster reports `Ready`
    pub ready: bool,
    /// One of [`gate_reasons`], for logs and condition messages
    pub reason: &'static str,
}

impl Readiness {
    fn not_ready(reason: &'static str) -> Self {
        Self {
            ready: false,
            reason,
        }
    }
}

/// Query the serving subsystem's readiness.
///
/// A missing `DataScienceCluster` (or a missing CRD) is reported as not ready
/// with reason `NotFound`. Any other store error is returned unmodified;
/// retrying is the caller's concern.
///
/// # Errors
///
/// Returns the store error when listing `DataScienceCluster` objects fails.
pub async fn is_ready<S: ObjectStore>(store: &S) -> Result<Readiness, StoreError> {
    let clusters = match store.list_cluster::<DataScienceCluster>().await {
        Ok(clusters) => clusters,
        Err(StoreError::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };

    let Some(dsc) = clusters.first() else {
        debug!("No DataScienceCluster found");
        return Ok(Readiness::not_ready(gate_reasons::NOT_FOUND));
    };
    let status = dsc.status.clone().unwrap_or_default();

    if status.phase.as_deref() != Some(DSC_READY_PHASE) {
        debug!(phase = ?status.phase, "DataScienceCluster not ready");
        return Ok(Readiness::not_ready(gate_reasons::PHASE_NOT_READY));
    }
    if !status
        .installed_components
        .get(KSERVE_COMPONENT)
        .copied()
        .unwrap_or(false)
    {
        debug!("KServe component not installed");
        return Ok(Readiness::not_ready(gate_reasons::COMPONENT_NOT_INSTALLED));
    }

    Ok(Readiness {
        ready: true,
        reason: gate_reasons::READY,
    })
}
