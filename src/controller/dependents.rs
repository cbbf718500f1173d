//! # Dependent Resources
//!
//! Builders for every resource the operator derives from an Account, App or
//! Runtime, and the [`DependentResource`] divergence rules for each kind.
//!
//! Names are derived from the owner's name so that a restarted operator finds
//! what a previous leader created.

use crate::constants::{API_KEY_SECRET_KEY, FIELD_MANAGER, NGC_API_KEY_ENV, NIM_ACCOUNT_LABEL};
use crate::controller::ngc::Catalog;
use crate::controller::sync::DependentResource;
use crate::crd::{InferenceService, ServingRuntime, StorageClaimSpec, Template, TemplateParameter};
use base64::Engine;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PersistentVolumeClaim, PodSpec, PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Template parameter names understood by the serving runtime template
pub mod template_params {
    pub const NIM_NAME: &str = "NIM_NAME";
    pub const NIM_IMAGE: &str = "NIM_IMAGE";
    pub const NIM_SECRET: &str = "NIM_SECRET";
    pub const NIM_PVC: &str = "NIM_PVC";
    pub const PULL_SECRET: &str = "PULL_SECRET";
}

pub fn account_template_name(account: &str) -> String {
    format!("{account}-template")
}

pub fn account_config_map_name(account: &str) -> String {
    format!("{account}-data")
}

pub fn app_template_name(app: &str) -> String {
    format!("{app}-serving-template")
}

pub fn app_config_map_name(app: &str) -> String {
    format!("{app}-content")
}

pub fn content_refresh_job_name(app: &str) -> String {
    format!("{app}-content-refresh")
}

pub fn revalidation_job_name(app: &str) -> String {
    format!("{app}-apikey-revalidate")
}

pub fn runtime_pvc_name(runtime: &str) -> String {
    format!("{runtime}-pvc")
}

pub fn runtime_pull_secret_name(runtime: &str) -> String {
    format!("{runtime}-ngc-secret")
}

pub fn runtime_nim_secret_name(runtime: &str) -> String {
    format!("{runtime}-nim-secrets")
}

fn meta(name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: (!labels.is_empty()).then(|| labels.clone()),
        ..ObjectMeta::default()
    }
}

/// Labels stamped on resources derived from an Account
pub fn account_labels(account: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(NIM_ACCOUNT_LABEL.to_string(), account.to_string())])
}

/// Template describing a KServe `ServingRuntime` for NIM images.
pub fn serving_template(name: &str, labels: &BTreeMap<String, String>) -> Template {
    use template_params::*;

    let runtime = json!({
        "apiVersion": "serving.kserve.io/v1alpha1",
        "kind": "ServingRuntime",
        "metadata": {
            "name": format!("${{{NIM_NAME}}}"),
            "labels": { "opendatahub.io/dashboard": "true" },
            "annotations": {
                "openshift.io/display-name": "NVIDIA NIM",
                "opendatahub.io/recommended-accelerators": "[\"nvidia.com/gpu\"]"
            }
        },
        "spec": {
            "annotations": {
                "prometheus.kserve.io/path": "/metrics",
                "prometheus.kserve.io/port": "8000",
                "serving.kserve.io/enable-metric-aggregation": "true",
                "serving.kserve.io/enable-prometheus-scraping": "true"
            },
            "multiModel": false,
            "protocolVersions": ["grpc-v2", "v2"],
            "supportedModelFormats": [
                { "name": format!("${{{NIM_NAME}}}"), "autoSelect": true, "version": "1" }
            ],
            "imagePullSecrets": [ { "name": format!("${{{PULL_SECRET}}}") } ],
            "containers": [{
                "name": "kserve-container",
                "image": format!("${{{NIM_IMAGE}}}"),
                "env": [
                    { "name": "NIM_CACHE_PATH", "value": "/mnt/models/cache" },
                    {
                        "name": NGC_API_KEY_ENV,
                        "valueFrom": { "secretKeyRef": { "name": format!("${{{NIM_SECRET}}}"), "key": NGC_API_KEY_ENV } }
                    }
                ],
                "ports": [ { "containerPort": 8000, "protocol": "TCP" } ],
                "volumeMounts": [
                    { "name": "shm", "mountPath": "/dev/shm" },
                    { "name": "nim-pvc", "mountPath": "/mnt/models/cache" }
                ]
            }],
            "volumes": [
                { "name": "nim-pvc", "persistentVolumeClaim": { "claimName": format!("${{{NIM_PVC}}}") } },
                { "name": "shm", "emptyDir": { "medium": "Memory", "sizeLimit": "2Gi" } }
            ]
        }
    });

    let parameters = [
        (NIM_NAME, "Model name, used as the runtime name and model format"),
        (NIM_IMAGE, "NIM container image"),
        (NIM_SECRET, "Secret holding NGC_API_KEY"),
        (NIM_PVC, "Claim caching the model weights"),
        (PULL_SECRET, "Image pull secret for the NIM registry"),
    ]
    .into_iter()
    .map(|(name, description)| TemplateParameter {
        name: name.to_string(),
        description: Some(description.to_string()),
        value: None,
        required: true,
    })
    .collect();

    let mut template = Template::new(name, vec![runtime], parameters);
    template.metadata.labels = (!labels.is_empty()).then(|| labels.clone());
    template
}

/// Keys must match `[-._a-zA-Z0-9]+` to be valid ConfigMap keys.
fn config_map_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// ConfigMap holding one JSON document per catalog entry, keyed by model name.
///
/// Each document carries the fully qualified image (without tag) under
/// `image` so runtimes can resolve a model without calling NGC.
pub fn catalog_config_map(
    name: &str,
    labels: &BTreeMap<String, String>,
    catalog: &Catalog,
    registry: &str,
) -> ConfigMap {
    let data = catalog
        .entries
        .iter()
        .map(|entry| {
            let mut doc = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));
            if let Value::Object(map) = &mut doc {
                map.insert(
                    "image".to_string(),
                    Value::String(format!("{registry}/{}", entry.resource_id)),
                );
            }
            (config_map_key(&entry.name), doc.to_string())
        })
        .collect();
    ConfigMap {
        metadata: meta(name, labels),
        data: Some(data),
        ..ConfigMap::default()
    }
}

/// Resolve `model` to a `image:tag` reference from a catalog ConfigMap.
#[must_use]
pub fn image_for_model(config_map: &ConfigMap, model: &str) -> Option<String> {
    let raw = config_map.data.as_ref()?.get(&config_map_key(model))?;
    let doc: Value = serde_json::from_str(raw).ok()?;
    let image = doc.get("image")?.as_str()?;
    match doc.get("latestTag").and_then(Value::as_str) {
        Some(tag) if !tag.is_empty() => Some(format!("{image}:{tag}")),
        _ => Some(image.to_string()),
    }
}

/// Settings shared by the CronJobs that poke an App
#[derive(Debug, Clone)]
pub struct CronJobSettings {
    pub schedule: String,
    pub image: String,
    pub service_account: String,
}

/// CronJob that merge-patches the App named `app` with `patch` on every run.
pub fn app_patch_cronjob(name: &str, app: &str, namespace: &str, patch: &Value, settings: &CronJobSettings) -> CronJob {
    let container = Container {
        name: "patch".to_string(),
        image: Some(settings.image.clone()),
        command: Some(vec!["kubectl".to_string()]),
        args: Some(vec![
            "patch".to_string(),
            "odhnimapp".to_string(),
            app.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--type=merge".to_string(),
            format!("--field-manager={FIELD_MANAGER}"),
            "--patch".to_string(),
            patch.to_string(),
        ]),
        ..Container::default()
    };

    CronJob {
        metadata: meta(name, &BTreeMap::new()),
        spec: Some(CronJobSpec {
            schedule: settings.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            containers: vec![container],
                            restart_policy: Some("Never".to_string()),
                            service_account_name: Some(settings.service_account.clone()),
                            ..PodSpec::default()
                        }),
                        ..PodTemplateSpec::default()
                    },
                    ..JobSpec::default()
                }),
                ..JobTemplateSpec::default()
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    }
}

/// Image pull secret for `registry` authenticating with an NGC API key.
pub fn image_pull_secret(name: &str, registry: &str, api_key: &str) -> Secret {
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("$oauthtoken:{api_key}"));
    let config = json!({
        "auths": {
            registry: { "username": "$oauthtoken", "password": api_key, "auth": auth }
        }
    });
    Secret {
        metadata: meta(name, &BTreeMap::new()),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(config.to_string().into_bytes()),
        )])),
        ..Secret::default()
    }
}

/// Opaque secret exposing the NGC API key to the serving container.
pub fn nim_secret(name: &str, api_key: &str) -> Secret {
    Secret {
        metadata: meta(name, &BTreeMap::new()),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            NGC_API_KEY_ENV.to_string(),
            ByteString(api_key.as_bytes().to_vec()),
        )])),
        ..Secret::default()
    }
}

/// Read the NGC API key from a credential secret.
#[must_use]
pub fn api_key_from_secret(secret: &Secret) -> Option<zeroize::Zeroizing<String>> {
    let bytes = secret.data.as_ref()?.get(API_KEY_SECRET_KEY)?;
    let key = String::from_utf8(bytes.0.clone()).ok()?;
    let key = key.trim();
    (!key.is_empty()).then(|| zeroize::Zeroizing::new(key.to_string()))
}

pub fn storage_claim(name: &str, spec: &StorageClaimSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(name, &BTreeMap::new()),
        spec: Some(spec.to_pvc_spec()),
        ..PersistentVolumeClaim::default()
    }
}

pub fn serving_runtime(name: &str, rendered: &Value) -> Option<ServingRuntime> {
    let spec = serde_json::from_value(rendered.get("spec")?.clone()).ok()?;
    let mut runtime = ServingRuntime::new(name, spec);
    if let Some(labels) = rendered.pointer("/metadata/labels") {
        runtime.metadata.labels = serde_json::from_value(labels.clone()).ok();
    }
    if let Some(annotations) = rendered.pointer("/metadata/annotations") {
        runtime.metadata.annotations = serde_json::from_value(annotations.clone()).ok();
    }
    Some(runtime)
}

/// Inference service from the user's spec, bound to the serving runtime `runtime`.
pub fn inference_service(name: &str, user_spec: &Value, runtime: &str) -> Option<InferenceService> {
    let mut spec = user_spec.clone();
    let model = spec.pointer_mut("/predictor/model")?.as_object_mut()?;
    model.insert("runtime".to_string(), Value::String(runtime.to_string()));
    let spec = serde_json::from_value(spec).ok()?;
    Some(InferenceService::new(name, spec))
}

/// Model name requested by a Runtime's inference service spec
#[must_use]
pub fn requested_model(user_spec: &Value) -> Option<&str> {
    user_spec
        .pointer("/predictor/model/modelFormat/name")
        .and_then(Value::as_str)
}

/// `desired` is contained in `actual`: every desired key is present with an
/// equal value. Extra keys in `actual` are server defaults and don't count.
fn json_subset(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(d), Value::Object(a)) => d
            .iter()
            .all(|(k, v)| a.get(k).is_some_and(|av| json_subset(v, av))),
        (Value::Array(d), Value::Array(a)) => {
            d.len() == a.len() && d.iter().zip(a).all(|(dv, av)| json_subset(dv, av))
        }
        _ => desired == actual,
    }
}

impl DependentResource for ConfigMap {
    fn diverges_from(&self, desired: &Self) -> bool {
        self.data != desired.data
    }
}

impl DependentResource for Secret {
    fn diverges_from(&self, desired: &Self) -> bool {
        self.data != desired.data || self.type_ != desired.type_
    }
}

impl DependentResource for Template {
    fn diverges_from(&self, desired: &Self) -> bool {
        self.objects != desired.objects || self.parameters != desired.parameters
    }
}

impl DependentResource for CronJob {
    fn diverges_from(&self, desired: &Self) -> bool {
        let summary = |job: &CronJob| {
            job.spec.as_ref().map(|spec| {
                let container = spec
                    .job_template
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .and_then(|p| p.containers.first());
                (
                    spec.schedule.clone(),
                    container.and_then(|c| c.image.clone()),
                    container.and_then(|c| c.args.clone()),
                )
            })
        };
        summary(self) != summary(desired)
    }
}

impl DependentResource for PersistentVolumeClaim {
    fn diverges_from(&self, desired: &Self) -> bool {
        let summary = |pvc: &PersistentVolumeClaim| {
            pvc.spec.as_ref().map(|spec| {
                (
                    spec.access_modes.clone(),
                    spec.resources.as_ref().and_then(|r| r.requests.clone()),
                )
            })
        };
        summary(self) != summary(desired)
    }
}

impl DependentResource for ServingRuntime {
    fn diverges_from(&self, desired: &Self) -> bool {
        !json_subset(&Value::Object(desired.spec.body.clone()), &Value::Object(self.spec.body.clone()))
    }
}

impl DependentResource for InferenceService {
    fn diverges_from(&self, desired: &Self) -> bool {
        !json_subset(&Value::Object(desired.spec.body.clone()), &Value::Object(self.spec.body.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ngc::CatalogEntry;

    fn catalog() -> Catalog {
        Catalog {
            entries: vec![CatalogEntry {
                name: "llama3-8b-instruct".to_string(),
                display_name: Some("Llama 3 8B".to_string()),
                resource_id: "nim/meta/llama3-8b-instruct".to_string(),
                latest_tag: Some("1.0.0".to_string()),
                description: None,
                updated_date: None,
            }],
        }
    }

    #[test]
    fn test_catalog_config_map_resolves_images() {
        let cm = catalog_config_map("c", &BTreeMap::new(), &catalog(), "nvcr.io");
        assert_eq!(
            image_for_model(&cm, "llama3-8b-instruct").as_deref(),
            Some("nvcr.io/nim/meta/llama3-8b-instruct:1.0.0")
        );
        assert!(image_for_model(&cm, "missing").is_none());
    }

    #[test]
    fn test_config_map_keys_are_sanitized() {
        assert_eq!(config_map_key("meta/llama 3"), "meta-llama-3");
    }

    #[test]
    fn test_serving_template_renders_a_runtime() {
        use template_params::*;
        let template = serving_template("t", &account_labels("acct"));
        let values = [
            (NIM_NAME, "llama3"),
            (NIM_IMAGE, "nvcr.io/nim/llama3:1"),
            (NIM_SECRET, "rt-nim-secrets"),
            (NIM_PVC, "rt-pvc"),
            (PULL_SECRET, "rt-ngc-secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let rendered = template.render_first(&values).unwrap();
        let runtime = serving_runtime("rt", &rendered).unwrap();
        assert_eq!(runtime.metadata.name.as_deref(), Some("rt"));
        assert_eq!(
            runtime.spec.body["containers"][0]["image"],
            "nvcr.io/nim/llama3:1"
        );
        assert_eq!(
            runtime.spec.body["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "rt-pvc"
        );
    }

    #[test]
    fn test_inference_service_binds_runtime() {
        let user = json!({"predictor": {"model": {"modelFormat": {"name": "llama3"}}}});
        assert_eq!(requested_model(&user), Some("llama3"));
        let isvc = inference_service("rt", &user, "rt").unwrap();
        assert_eq!(isvc.spec.body["predictor"]["model"]["runtime"], "rt");
        assert!(inference_service("rt", &json!({}), "rt").is_none());
    }

    #[test]
    fn test_pull_secret_encodes_oauth_token() {
        let secret = image_pull_secret("s", "nvcr.io", "key");
        let raw = &secret.data.unwrap()[".dockerconfigjson"].0;
        let doc: Value = serde_json::from_slice(raw).unwrap();
        assert_eq!(doc["auths"]["nvcr.io"]["password"], "key");
        assert_eq!(doc["auths"]["nvcr.io"]["auth"], "JG9hdXRodG9rZW46a2V5");
    }

    #[test]
    fn test_api_key_is_trimmed_and_required() {
        let mut secret = Secret::default();
        assert!(api_key_from_secret(&secret).is_none());
        secret.data = Some(BTreeMap::from([(
            API_KEY_SECRET_KEY.to_string(),
            ByteString(b" abc\n".to_vec()),
        )]));
        assert_eq!(api_key_from_secret(&secret).unwrap().as_str(), "abc");
    }

    #[test]
    fn test_server_defaults_are_not_divergence() {
        let desired = ServingRuntime::new("rt", crate::crd::ServingRuntimeSpec {
            body: json!({"multiModel": false}).as_object().cloned().unwrap(),
        });
        let mut stored = desired.clone();
        stored.spec.body.insert("builtInAdapter".to_string(), json!({}));
        assert!(!stored.diverges_from(&desired));
        stored.spec.body.insert("multiModel".to_string(), json!(true));
        assert!(stored.diverges_from(&desired));
    }

    #[test]
    fn test_cronjob_divergence_tracks_schedule() {
        let settings = CronJobSettings {
            schedule: "0 0 * * *".to_string(),
            image: "cli".to_string(),
            service_account: "sa".to_string(),
        };
        let patch = json!({"spec": {"content": {"update": true}}});
        let a = app_patch_cronjob("j", "app", "ns", &patch, &settings);
        let b = app_patch_cronjob("j", "app", "ns", &patch, &CronJobSettings {
            schedule: "0 * * * *".to_string(),
            ..settings.clone()
        });
        assert!(!a.diverges_from(&a.clone()));
        assert!(a.diverges_from(&b));
    }
}
