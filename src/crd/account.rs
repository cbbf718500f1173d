//! # OdhNIMAccount
//!
//! Cluster-admin facing resource binding an NGC credential to the serving
//! subsystem. Its status carries the Template and ConfigMap derived while the
//! serving subsystem is ready.

use super::{Condition, ResourceRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// OdhNIMAccount Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: nim.opendatahub.io/v1alpha1
/// kind: OdhNIMAccount
/// metadata:
///   name: nim-account
///   namespace: opendatahub
/// spec:
///   secretRef:
///     name: ngc-api-key
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "OdhNIMAccount",
    root = "NimAccount",
    group = "nim.opendatahub.io",
    version = "v1alpha1",
    namespaced,
    status = "NimAccountStatus",
    shortname = "onima",
    printcolumn = r#"{"name":"Template", "type":"string", "jsonPath":".status.templateRef.name"}, {"name":"ConfigMap", "type":"string", "jsonPath":".status.configMapRef.name"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"KServeReadiness\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NimAccountSpec {
    /// Secret holding the NGC API key under the `api_key` data key
    pub secret_ref: ResourceRef,
}

/// Status of the OdhNIMAccount resource
///
/// Both references are set only while the serving subsystem is ready and are
/// cleared together when it is not.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NimAccountStatus {
    /// Derived serving-runtime Template
    #[serde(default)]
    pub template_ref: Option<ResourceRef>,
    /// Derived generated-config ConfigMap
    #[serde(default)]
    pub config_map_ref: Option<ResourceRef>,
    /// `KServeReadiness`, `APIKeyValidation`, `TemplateUpdate` and
    /// `ConfigMapUpdate`
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
