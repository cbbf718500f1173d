//! # Leader Election
//!
//! Single-active-replica guarantee over a `coordination.k8s.io/v1` Lease.
//!
//! Acquire and renew are compare-and-swap writes on the Lease's
//! `resourceVersion`: a 409 means another replica moved first and this one
//! stands by. Lease timing is 30s duration, 10s renew, 5s retry.

use crate::constants::{
    FIELD_MANAGER, LEADER_LEASE_DURATION_SECS, LEADER_RENEW_INTERVAL_SECS,
    LEADER_RETRY_INTERVAL_SECS,
};
use crate::observability::metrics;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease_name", &self.lease_name)
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(LEADER_LEASE_DURATION_SECS),
            renew_interval: Duration::from_secs(LEADER_RENEW_INTERVAL_SECS),
            retry_interval: Duration::from_secs(LEADER_RETRY_INTERVAL_SECS),
        }
    }

    /// Identity of this replica: the pod name, falling back to the process id.
    #[must_use]
    pub fn default_identity() -> String {
        std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("nim-operator-{}", std::process::id()))
    }

    /// Block until the lease is held, then keep renewing it in the background.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    metrics::set_leader(true);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica, waiting...");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying...");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if !held_by_us && !lease_expired(&spec, now) {
            return Ok(false);
        }

        let resource_version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;
        let transitions = spec.lease_transitions.unwrap_or(0);
        let updated = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(resource_version),
                ..ObjectMeta::default()
            },
            spec: Some(if held_by_us {
                LeaseSpec {
                    renew_time: Some(MicroTime(now)),
                    ..spec
                }
            } else {
                self.fresh_spec(now, transitions + 1)
            }),
        };

        match api.replace(&self.lease_name, &post_params(), &updated).await {
            Ok(_) => {
                if !held_by_us {
                    info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(self.fresh_spec(now, 0)),
        };
        match api.create(&post_params(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn fresh_spec(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: i32::try_from(self.lease_duration.as_secs()).ok(),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    metrics::set_leader(false);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            }
        });
        api.patch(&self.lease_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    }
}

/// Whether the lease holder missed its renewal window at `now`.
fn lease_expired(spec: &LeaseSpec, now: chrono::DateTime<Utc>) -> bool {
    match (spec.holder_identity.as_deref(), &spec.renew_time, spec.lease_duration_seconds) {
        (None, _, _) => true,
        (Some(_), Some(renewed), Some(duration)) => now > renewed.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

/// Held leadership; renewal stops when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for LeaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGuard")
            .field("elector", &self.elector)
            .finish_non_exhaustive()
    }
}

impl LeaderGuard {
    /// Resolves once the lease could not be renewed.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Hand the lease over on graceful shutdown.
    ///
    /// # Errors
    ///
    /// API failures while clearing the holder.
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        metrics::set_leader(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..LeaseSpec::default()
        }
    }

    #[test]
    fn test_fresh_lease_is_not_expired() {
        assert!(!lease_expired(&spec(Some("pod-a"), 5), Utc::now()));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        assert!(lease_expired(&spec(Some("pod-a"), 45), Utc::now()));
    }

    #[test]
    fn test_released_lease_is_expired() {
        assert!(lease_expired(&spec(None, 0), Utc::now()));
        assert!(lease_expired(&LeaseSpec::default(), Utc::now()));
    }
}
