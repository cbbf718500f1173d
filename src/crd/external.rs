//! # External Resource Types
//!
//! Typed views of the resources owned by other operators that this operator
//! reads or provisions. Only the fields the operator uses are modelled; the
//! rest is carried through as JSON.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::core::TypeMeta;
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Open Data Hub cluster-wide installation status (`datasciencecluster.opendatahub.io/v1`)
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    kind = "DataScienceCluster",
    group = "datasciencecluster.opendatahub.io",
    version = "v1",
    status = "DataScienceClusterStatus",
    schema = "disabled"
)]
pub struct DataScienceClusterSpec {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataScienceClusterStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub installed_components: BTreeMap<String, bool>,
}

/// KServe serving runtime (`serving.kserve.io/v1alpha1`)
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    kind = "ServingRuntime",
    group = "serving.kserve.io",
    version = "v1alpha1",
    namespaced,
    schema = "disabled"
)]
pub struct ServingRuntimeSpec {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// KServe inference service (`serving.kserve.io/v1beta1`)
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    kind = "InferenceService",
    group = "serving.kserve.io",
    version = "v1beta1",
    namespaced,
    schema = "disabled"
)]
pub struct InferenceServiceSpec {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// OpenShift template (`template.openshift.io/v1`)
///
/// Templates have no `spec`; objects and parameters sit at the top level, so
/// the resource impl is written by hand.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Template {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub objects: Vec<Value>,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl Template {
    pub fn new(name: &str, objects: Vec<Value>, parameters: Vec<TemplateParameter>) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: "template.openshift.io/v1".to_string(),
                kind: "Template".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            objects,
            parameters,
        }
    }

    /// Render the first templated object, substituting `${NAME}` placeholders
    /// with `values`, falling back to parameter defaults.
    ///
    /// Returns `None` when the template carries no objects or a required
    /// parameter has neither a value nor a default.
    #[must_use]
    pub fn render_first(&self, values: &BTreeMap<String, String>) -> Option<Value> {
        let object = self.objects.first()?;
        let mut text = object.to_string();
        for param in &self.parameters {
            let value = match (values.get(&param.name), &param.value) {
                (Some(v), _) | (None, Some(v)) => v,
                (None, None) if param.required => return None,
                (None, None) => "",
            };
            // Values are JSON-escaped since the placeholders live inside JSON strings.
            let escaped = serde_json::to_string(value).ok()?;
            let escaped = &escaped[1..escaped.len() - 1];
            text = text.replace(&format!("${{{}}}", param.name), escaped);
        }
        serde_json::from_str(&text).ok()
    }
}

impl Resource for Template {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("Template")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("template.openshift.io")
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("v1")
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("templates")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> Template {
        Template::new(
            "t",
            vec![json!({"kind": "ServingRuntime", "spec": {"image": "${REGISTRY}/nim:${TAG}"}})],
            vec![
                TemplateParameter {
                    name: "REGISTRY".to_string(),
                    required: true,
                    ..TemplateParameter::default()
                },
                TemplateParameter {
                    name: "TAG".to_string(),
                    value: Some("latest".to_string()),
                    ..TemplateParameter::default()
                },
            ],
        )
    }

    #[test]
    fn test_render_substitutes_values_and_defaults() {
        let values = BTreeMap::from([("REGISTRY".to_string(), "nvcr.io".to_string())]);
        let rendered = template().render_first(&values).unwrap();
        assert_eq!(rendered["spec"]["image"], "nvcr.io/nim:latest");
    }

    #[test]
    fn test_render_requires_required_parameters() {
        assert!(template().render_first(&BTreeMap::new()).is_none());
    }

    #[test]
    fn test_template_resource_metadata() {
        assert_eq!(Template::api_version(&()), "template.openshift.io/v1");
        assert_eq!(Template::plural(&()), "templates");
        let value = serde_json::to_value(template()).unwrap();
        assert_eq!(value["kind"], "Template");
    }

    #[test]
    fn test_dsc_status_parses_installed_components() {
        let status: DataScienceClusterStatus = serde_json::from_value(json!({
            "phase": "Ready",
            "installedComponents": {"kserve": true, "dashboard": false}
        }))
        .unwrap();
        assert_eq!(status.installed_components.get("kserve"), Some(&true));
    }
}
