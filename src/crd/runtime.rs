//! # OdhNIMRuntime
//!
//! Describes one NIM deployment: the storage claim for model weights, the
//! KServe inference service and the Account whose credential and template it
//! is provisioned from.

use super::{preserve_unknown_fields, Condition, ResourceRef};
use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OdhNIMRuntime Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: nim.opendatahub.io/v1alpha1
/// kind: OdhNIMRuntime
/// metadata:
///   name: llama3
///   namespace: opendatahub
/// spec:
///   odhNIMAccountRef:
///     name: nim-account
///   pvcSpec:
///     accessModes: ["ReadWriteOnce"]
///     resources:
///       requests:
///         storage: 50Gi
///   inferenceServiceSpec:
///     predictor:
///       model:
///         modelFormat:
///           name: nvidia-nim-llama3-8b-instruct
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "OdhNIMRuntime",
    root = "NimRuntime",
    group = "nim.opendatahub.io",
    version = "v1alpha1",
    namespaced,
    status = "NimRuntimeStatus",
    shortname = "onimr",
    printcolumn = r#"{"name":"PVC", "type":"string", "jsonPath":".status.conditions[?(@.type==\"PVCReconciled\")].status"}, {"name":"Pull Secret", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ImagePullSecretReconciled\")].status"}, {"name":"NIM Secret", "type":"string", "jsonPath":".status.conditions[?(@.type==\"NimSecretReconciled\")].status"}, {"name":"ServingRuntime", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ServingRuntimeReconciled\")].status"}, {"name":"InferenceService", "type":"string", "jsonPath":".status.conditions[?(@.type==\"InferenceReconciledCreation\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NimRuntimeSpec {
    /// KServe `InferenceService` spec, passed through untouched apart from the
    /// serving runtime binding
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub inference_service_spec: serde_json::Value,
    /// Storage claim for the NIM model cache
    pub pvc_spec: StorageClaimSpec,
    /// Account providing the credential and serving template
    #[serde(rename = "odhNIMAccountRef")]
    pub account_ref: ResourceRef,
}

/// Subset of `PersistentVolumeClaimSpec` a Runtime may request
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClaimSpec {
    /// e.g. `ReadWriteOnce`
    #[serde(default)]
    pub access_modes: Vec<String>,
    /// Cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// `Filesystem` or `Block`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default)]
    pub resources: StorageResources,
}

/// Storage requests and limits as quantity strings
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageResources {
    /// e.g. `storage: 50Gi`
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl StorageClaimSpec {
    /// Convert into the core API claim spec.
    #[must_use]
    pub fn to_pvc_spec(&self) -> PersistentVolumeClaimSpec {
        let quantities = |m: &BTreeMap<String, String>| {
            (!m.is_empty()).then(|| {
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<_, _>>()
            })
        };
        PersistentVolumeClaimSpec {
            access_modes: (!self.access_modes.is_empty()).then(|| self.access_modes.clone()),
            storage_class_name: self.storage_class_name.clone(),
            volume_mode: self.volume_mode.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: quantities(&self.resources.requests),
                limits: quantities(&self.resources.limits),
            }),
            ..PersistentVolumeClaimSpec::default()
        }
    }
}

/// Status of the OdhNIMRuntime resource
///
/// Each reference is recorded once its stage has succeeded.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NimRuntimeStatus {
    /// Model cache claim
    #[serde(default)]
    pub pvc_ref: Option<ResourceRef>,
    /// `kubernetes.io/dockerconfigjson` Secret for the NIM registry
    #[serde(default)]
    pub image_pull_secret_ref: Option<ResourceRef>,
    /// Secret exposing `NGC_API_KEY` to the serving container
    #[serde(default)]
    pub nim_secret_ref: Option<ResourceRef>,
    /// KServe `ServingRuntime` rendered from the Account's Template
    #[serde(default)]
    pub serving_runtime_ref: Option<ResourceRef>,
    /// KServe `InferenceService` bound to the serving runtime
    #[serde(default)]
    pub inference_service_ref: Option<ResourceRef>,
    /// One condition per provisioning stage
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
