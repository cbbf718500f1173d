//! # Object Store
//!
//! The seam between reconcilers and the Kubernetes API server.
//!
//! Reconcilers only talk to the cluster through [`ObjectStore`], so they can be
//! driven against the in-memory store in the integration tests. [`KubeStore`]
//! is the production implementation over `kube::Api`.
//!
//! Every write carries the object's `resourceVersion`; a stale copy is
//! rejected with [`StoreError::Conflict`] and the caller re-queues instead of
//! retrying against it.

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use thiserror::Error;

use crate::constants::FIELD_MANAGER;

/// Errors returned by an [`ObjectStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("conflicting write to {kind} {namespace}/{name}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("failed to serialize {kind}: {source}")]
    Serialization {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Classify a kube client error for the object `kind ns/name`.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        let (kind, namespace, name) = (kind.to_string(), namespace.to_string(), name.to_string());
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => Self::NotFound {
                kind,
                namespace,
                name,
            },
            kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind,
                    namespace,
                    name,
                }
            }
            kube::Error::Api(api_err) if api_err.code == 409 => Self::Conflict {
                kind,
                namespace,
                name,
            },
            other => Self::Kube(other),
        }
    }
}

/// Namespaced object the store can read and write
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Cluster-scoped object the store can list
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ClusterObject for T where
    T: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Typed access to the shared, versioned object store
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError>;

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>, StoreError>;

    /// Create an object in `namespace`; fails with `AlreadyExists` on a name clash.
    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;

    /// Replace metadata and spec. Status is left untouched.
    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the status subresource. Metadata and spec are left untouched.
    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    /// Request deletion; fails with `NotFound` when the object is already gone.
    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn identity<K: Resource<DynamicType = ()>>(obj: &K) -> (String, String) {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), namespace, name))
    }

    async fn list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), namespace, ""))
    }

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), "", ""))
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.meta().name.clone().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        api.create(&pp, obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), namespace, &name))
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = identity(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        api.replace(&name, &pp, obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), &namespace, &name))
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = identity(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let value = serde_json::to_value(obj).map_err(|source| StoreError::Serialization {
            kind: K::kind(&()).into_owned(),
            source,
        })?;
        // Carrying resourceVersion turns the merge patch into a compare-and-swap.
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), &namespace, &name))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &K::kind(&()), namespace, name))
    }
}
