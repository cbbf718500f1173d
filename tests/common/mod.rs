//! Common test utilities for the reconciler integration tests
//!
//! Provides an in-memory [`ObjectStore`] that behaves like the API server in
//! the ways the reconcilers depend on (resourceVersion conflicts,
//! finalizer-aware deletion, owner-reference cascade), a mock of the NGC
//! capability and builders for the objects the tests seed.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use mockall::mock;
use nim_operator::config::ControllerConfig;
use nim_operator::constants::{API_KEY_SECRET_KEY, NIM_APP_LABEL};
use nim_operator::controller::ngc::{Catalog, CatalogEntry, NgcApi, NgcError};
use nim_operator::controller::reconciler::Reconciler;
use nim_operator::controller::store::{ClusterObject, ObjectStore, StoreError, StoreObject};
use nim_operator::crd::{
    DataScienceCluster, DataScienceClusterSpec, DataScienceClusterStatus, NimAccount,
    NimAccountSpec, NimApp, NimAppSpec, NimRuntime, NimRuntimeSpec, ResourceRef,
    StorageClaimSpec, StorageResources,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Once};

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests that open HTTP clients
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        // Another test binary setup may have installed one already.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub const NS: &str = "ns1";
pub const MODEL: &str = "llama3-8b-instruct";

mock! {
    pub Ngc {}

    #[async_trait]
    impl NgcApi for Ngc {
        async fn validate_api_key(&self, api_key: &str) -> Result<bool, NgcError>;
        async fn fetch_catalog(&self) -> Result<Catalog, NgcError>;
    }
}

/// NGC mock that accepts every key and serves [`sample_catalog`]
pub fn healthy_ngc() -> MockNgc {
    let mut ngc = MockNgc::new();
    ngc.expect_validate_api_key().returning(|_| Ok(true));
    ngc.expect_fetch_catalog().returning(|| Ok(sample_catalog()));
    ngc
}

pub fn ngc_unavailable(operation: &'static str) -> NgcError {
    NgcError::UnexpectedStatus {
        operation,
        status: 503,
    }
}

pub fn sample_catalog() -> Catalog {
    Catalog {
        entries: vec![
            CatalogEntry {
                name: MODEL.to_string(),
                display_name: Some("Llama 3 8B Instruct".to_string()),
                resource_id: "nim/meta/llama3-8b-instruct".to_string(),
                latest_tag: Some("1.0.0".to_string()),
                description: None,
                updated_date: Some("2024-06-01T00:00:00Z".to_string()),
            },
            CatalogEntry {
                name: "mistral-7b-instruct".to_string(),
                display_name: None,
                resource_id: "nim/mistralai/mistral-7b-instruct".to_string(),
                latest_tag: None,
                description: None,
                updated_date: None,
            },
        ],
    }
}

/// Reconciler context over a fresh [`MemoryStore`]
pub fn context(ngc: MockNgc) -> Reconciler<MemoryStore> {
    context_with(ngc, ControllerConfig::default())
}

pub fn context_with(ngc: MockNgc, config: ControllerConfig) -> Reconciler<MemoryStore> {
    Reconciler::new(MemoryStore::default(), Arc::new(ngc), config)
}

// --- builders ---------------------------------------------------------------

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

/// Credential Secret carrying `api_key`, optionally labeled for NIM
pub fn credential(name: &str, namespace: &str, labeled: bool) -> Secret {
    let mut secret = Secret {
        metadata: meta(name, namespace),
        data: Some(BTreeMap::from([(
            API_KEY_SECRET_KEY.to_string(),
            ByteString(b"nvapi-test-key".to_vec()),
        )])),
        ..Secret::default()
    };
    if labeled {
        secret.metadata.labels = Some(BTreeMap::from([(NIM_APP_LABEL.to_string(), "true".to_string())]));
    }
    secret
}

pub fn dsc(phase: &str, kserve: bool) -> DataScienceCluster {
    let mut dsc = DataScienceCluster::new("default-dsc", DataScienceClusterSpec::default());
    dsc.status = Some(DataScienceClusterStatus {
        phase: Some(phase.to_string()),
        installed_components: BTreeMap::from([("kserve".to_string(), kserve)]),
    });
    dsc
}

pub fn ready_dsc() -> DataScienceCluster {
    dsc("Ready", true)
}

pub fn account(name: &str, secret: &str) -> NimAccount {
    let mut account = NimAccount::new(
        name,
        NimAccountSpec {
            secret_ref: ResourceRef::named(secret, NS),
        },
    );
    account.metadata.namespace = Some(NS.to_string());
    account
}

pub fn app(name: &str, secret: Option<&str>) -> NimApp {
    let mut app = NimApp::new(name, NimAppSpec::default());
    app.spec.api_key.secret_ref = secret.map(|s| ResourceRef::named(s, NS));
    app.metadata.namespace = Some(NS.to_string());
    app
}

pub fn runtime(name: &str, account: &str, model: Option<&str>) -> NimRuntime {
    let model_spec = match model {
        Some(model) => json!({ "modelFormat": { "name": model }, "resources": { "limits": { "nvidia.com/gpu": "1" } } }),
        None => json!({ "resources": {} }),
    };
    let mut runtime = NimRuntime::new(
        name,
        NimRuntimeSpec {
            inference_service_spec: json!({ "predictor": { "model": model_spec } }),
            pvc_spec: StorageClaimSpec {
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: StorageResources {
                    requests: BTreeMap::from([("storage".to_string(), "50Gi".to_string())]),
                    limits: BTreeMap::new(),
                },
                ..StorageClaimSpec::default()
            },
            account_ref: ResourceRef {
                name: account.to_string(),
                ..ResourceRef::default()
            },
        },
    );
    runtime.metadata.namespace = Some(NS.to_string());
    runtime
}

// --- in-memory store --------------------------------------------------------

type Key = (String, String, String);

fn type_key<K: Resource<DynamicType = ()>>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn serialization<K: Resource<DynamicType = ()>>(source: serde_json::Error) -> StoreError {
    StoreError::Serialization {
        kind: K::kind(&()).into_owned(),
        source,
    }
}

/// Which write the next injected conflict applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Write {
    Replace,
    ReplaceStatus,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    cluster: BTreeMap<(String, String), Value>,
    revision: u64,
    writes: usize,
    conflicts: HashMap<Write, usize>,
    cluster_list_failures: usize,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_conflict(&mut self, write: Write) -> bool {
        match self.conflicts.get_mut(&write) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    /// Remove `key` and everything that (transitively) names it as owner.
    /// Dependents with finalizers are only marked for deletion.
    fn remove_cascading(&mut self, key: &Key) {
        let mut pending = vec![key.clone()];
        while let Some(key) = pending.pop() {
            let Some(removed) = self.objects.remove(&key) else {
                continue;
            };
            let Some(uid) = removed.pointer("/metadata/uid").and_then(Value::as_str) else {
                continue;
            };
            let dependents: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, v)| owned_by(v, uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dependent in dependents {
                if has_finalizers(&self.objects[&dependent]) {
                    let revision = self.next_revision();
                    if let Some(obj) = self.objects.get_mut(&dependent) {
                        mark_deleting(obj, &revision);
                    }
                } else {
                    pending.push(dependent);
                }
            }
        }
    }
}

fn owned_by(obj: &Value, uid: &str) -> bool {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| refs.iter().any(|r| r["uid"] == uid))
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null())
}

fn mark_deleting(obj: &mut Value, revision: &str) {
    if !is_deleting(obj) {
        obj["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
    }
    obj["metadata"]["resourceVersion"] = json!(revision);
}

/// Shared, versioned object store held in memory
///
/// Cloning shares the underlying state, like two clients of one API server.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store `obj` as if created by a user, bypassing write accounting.
    pub fn seed<K: StoreObject>(&self, obj: &K) -> K {
        let mut value = serde_json::to_value(obj).unwrap();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut state = self.lock();
        let revision = state.next_revision();
        value["metadata"]["resourceVersion"] = json!(revision);
        value["metadata"]["uid"] = json!(format!("uid-{name}-{revision}"));
        state
            .objects
            .insert((type_key::<K>(), namespace, name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Store a cluster-scoped object.
    pub fn seed_cluster<K: ClusterObject + Serialize>(&self, obj: &K) {
        let value = serde_json::to_value(obj).unwrap();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.lock().cluster.insert((type_key::<K>(), name), value);
    }

    pub fn remove_cluster<K: ClusterObject>(&self, name: &str) {
        self.lock().cluster.remove(&(type_key::<K>(), name.to_string()));
    }

    /// Make the next `count` writes of the given type fail with a conflict.
    pub fn inject_conflicts(&self, write: Write, count: usize) {
        self.lock().conflicts.insert(write, count);
    }

    /// Fail the next `count` cluster-scoped lists, as if the API server were
    /// returning garbage.
    pub fn fail_cluster_lists(&self, count: usize) {
        self.lock().cluster_list_failures = count;
    }

    /// Number of successful writes issued through the [`ObjectStore`] API
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Read without going through the trait, panicking on decode errors.
    pub fn fetch<K: StoreObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(type_key::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn exists<K: StoreObject>(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&(type_key::<K>(), namespace.to_string(), name.to_string()))
    }

    pub fn count<K: StoreObject>(&self, namespace: &str) -> usize {
        let kind = type_key::<K>();
        self.lock()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }

    /// Owner references (as `kind/name`) that point at objects no longer stored
    pub fn dangling_owner_refs(&self) -> Vec<String> {
        let state = self.lock();
        let uids: Vec<&str> = state
            .objects
            .values()
            .filter_map(|v| v.pointer("/metadata/uid").and_then(Value::as_str))
            .collect();
        state
            .objects
            .values()
            .filter_map(|v| v.pointer("/metadata/ownerReferences").and_then(Value::as_array))
            .flatten()
            .filter(|r| !uids.contains(&r["uid"].as_str().unwrap_or_default()))
            .map(|r| format!("{}/{}", r["kind"].as_str().unwrap_or_default(), r["name"].as_str().unwrap_or_default()))
            .collect()
    }

    /// Objects of kind `K` in `namespace` whose owner is not marked with a finalizer
    pub fn owned_by_unfinalized<K: StoreObject, O: StoreObject>(&self, namespace: &str) -> Vec<String> {
        let state = self.lock();
        let owner_kind = type_key::<O>();
        let unfinalized: Vec<&str> = state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == owner_kind && ns == namespace && !has_finalizers(v))
            .filter_map(|(_, v)| v.pointer("/metadata/uid").and_then(Value::as_str))
            .collect();
        let kind = type_key::<K>();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && unfinalized.iter().any(|uid| owned_by(v, uid)))
            .map(|((_, _, name), _)| name.clone())
            .collect()
    }

    fn decode<K: StoreObject>(value: Value) -> Result<K, StoreError> {
        serde_json::from_value(value).map_err(serialization::<K>)
    }
}

fn not_found<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        kind: K::kind(&()).into_owned(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn conflict<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> StoreError {
    StoreError::Conflict {
        kind: K::kind(&()).into_owned(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn identity<K: Resource<DynamicType = ()>>(obj: &K) -> (String, String) {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn stale(stored: &Value, incoming: Option<&String>) -> bool {
    incoming.is_some_and(|rv| stored["metadata"]["resourceVersion"].as_str() != Some(rv.as_str()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let value = self
            .lock()
            .objects
            .get(&(type_key::<K>(), namespace.to_string(), name.to_string()))
            .cloned();
        value.map(Self::decode).transpose()
    }

    async fn list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let kind = type_key::<K>();
        let values: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        values.into_iter().map(Self::decode).collect()
    }

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>, StoreError> {
        let kind = type_key::<K>();
        let mut state = self.lock();
        if state.cluster_list_failures > 0 {
            state.cluster_list_failures -= 1;
            return Err(StoreError::Serialization {
                kind: K::kind(&()).into_owned(),
                source: serde_json::from_str::<Value>("{").unwrap_err(),
            });
        }
        let values: Vec<Value> = state
            .cluster
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect();
        drop(state);
        values
            .into_iter()
            .map(|v| {
                serde_json::from_value(v).map_err(|source| StoreError::Serialization {
                    kind: K::kind(&()).into_owned(),
                    source,
                })
            })
            .collect()
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = (type_key::<K>(), namespace.to_string(), name.clone());
        let mut value = serde_json::to_value(obj).map_err(serialization::<K>)?;

        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::kind(&()).into_owned(),
                namespace: namespace.to_string(),
                name,
            });
        }
        let revision = state.next_revision();
        let metadata = &mut value["metadata"];
        metadata["namespace"] = json!(namespace);
        metadata["resourceVersion"] = json!(revision);
        metadata["uid"] = json!(format!("uid-{name}-{revision}"));
        metadata["creationTimestamp"] = json!("2026-01-01T00:00:00Z");
        state.objects.insert(key, value.clone());
        state.writes += 1;
        drop(state);
        Self::decode(value)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = identity(obj);
        let key = (type_key::<K>(), namespace.clone(), name.clone());
        let mut value = serde_json::to_value(obj).map_err(serialization::<K>)?;

        let mut state = self.lock();
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(&namespace, &name));
        };
        if stale(&stored, obj.meta().resource_version.as_ref()) || state.take_conflict(Write::Replace) {
            return Err(conflict::<K>(&namespace, &name));
        }

        // Server-owned metadata and the status subresource survive a PUT.
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match stored["metadata"].get(field) {
                Some(v) => value["metadata"][field] = v.clone(),
                None => {
                    if let Some(meta) = value["metadata"].as_object_mut() {
                        meta.remove(field);
                    }
                }
            }
        }
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let revision = state.next_revision();
        value["metadata"]["resourceVersion"] = json!(revision);
        state.writes += 1;

        if is_deleting(&value) && !has_finalizers(&value) {
            state.remove_cascading(&key);
        } else {
            state.objects.insert(key, value.clone());
        }
        drop(state);
        Self::decode(value)
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = identity(obj);
        let key = (type_key::<K>(), namespace.clone(), name.clone());
        let incoming = serde_json::to_value(obj).map_err(serialization::<K>)?;

        let mut state = self.lock();
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(&namespace, &name));
        };
        if stale(&stored, obj.meta().resource_version.as_ref()) || state.take_conflict(Write::ReplaceStatus) {
            return Err(conflict::<K>(&namespace, &name));
        }
        stored["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        let revision = state.next_revision();
        stored["metadata"]["resourceVersion"] = json!(revision);
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        drop(state);
        Self::decode(stored)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (type_key::<K>(), namespace.to_string(), name.to_string());
        let mut state = self.lock();
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(namespace, name));
        };
        if has_finalizers(&stored) {
            if !is_deleting(&stored) {
                let revision = state.next_revision();
                if let Some(obj) = state.objects.get_mut(&key) {
                    mark_deleting(obj, &revision);
                }
                state.writes += 1;
            }
        } else {
            state.remove_cascading(&key);
            state.writes += 1;
        }
        Ok(())
    }
}
