//! # Shared Status Types
//!
//! Condition and object reference types shared by all three custom resources.

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a condition, serialized as `True`, `False` or `Unknown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named observation about a resource
///
/// Conditions are keyed by `type`; see [`crate::controller::conditions`] for the
/// upsert rules that govern `lastTransitionTime`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    /// RFC3339 timestamp of the last status change for this type
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable CamelCase reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable detail
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build a condition without a transition time; the tracker stamps it on insert.
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            last_transition_time: None,
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }
}

/// Reference to another Kubernetes object
///
/// Mirrors the subset of `core/v1 ObjectReference` the operator reads and writes.
/// `namespace` defaults to the referencing object's namespace when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceRef {
    /// Reference by name and namespace only.
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Full reference to a stored object, including kind and uid.
    pub fn to_object<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = obj.meta();
        Self {
            api_version: Some(K::api_version(&()).into_owned()),
            kind: Some(K::kind(&()).into_owned()),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
        }
    }

    /// Namespace of the referenced object, falling back to `default_namespace`.
    #[must_use]
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }

    /// Whether this reference names `name` in `namespace`, resolving an absent
    /// namespace against `owner_namespace`.
    #[must_use]
    pub fn points_at(&self, name: &str, namespace: &str, owner_namespace: &str) -> bool {
        self.name == name && self.namespace_or(owner_namespace) == namespace
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
