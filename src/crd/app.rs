//! # OdhNimApp
//!
//! Per-namespace resource driving credential validation and catalog content
//! refresh. `apiKey.validate` and `content.update` are edge-triggered command
//! flags: the reconciler resets them to `false` after acting on them.

use super::{Condition, ResourceRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// OdhNimApp Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: nim.opendatahub.io/v1alpha1
/// kind: OdhNimApp
/// metadata:
///   name: nim-app
///   namespace: my-project
/// spec:
///   apiKey:
///     validate: true
///     secretRef:
///       name: ngc-api-key
///   content:
///     update: true
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "OdhNimApp",
    root = "NimApp",
    group = "nim.opendatahub.io",
    version = "v1alpha1",
    namespaced,
    status = "NimAppStatus",
    shortname = "ona",
    printcolumn = r#"{"name":"Validated", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ApiKeyValidated\")].status"}, {"name":"Updated", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ContentUpdated\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NimAppSpec {
    /// NGC credential and its validation trigger
    #[serde(default)]
    pub api_key: ApiKeySpec,
    /// Catalog content and its refresh trigger
    #[serde(default)]
    pub content: ContentSpec,
    /// Serving-runtime Template created for this App, set once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<ResourceRef>,
}

/// Credential binding and validation trigger
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySpec {
    /// Set to true to request a validation pass
    #[serde(default = "default_true")]
    pub validate: bool,
    /// Secret holding the NGC API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ResourceRef>,
}

impl Default for ApiKeySpec {
    fn default() -> Self {
        Self {
            validate: true,
            secret_ref: None,
        }
    }
}

/// Catalog content binding and refresh trigger
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    /// Set to true to request a catalog refresh
    #[serde(default = "default_true")]
    pub update: bool,
    /// ConfigMap holding the fetched catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ResourceRef>,
}

impl Default for ContentSpec {
    fn default() -> Self {
        Self {
            update: true,
            config_map_ref: None,
        }
    }
}

/// Status of the OdhNimApp resource
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NimAppStatus {
    /// `ApiKeyValidated` and `ContentUpdated`
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn default_true() -> bool {
    true
}
