//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! Wire-level names (API group, finalizer, labels, condition types and
//! reasons) are part of the contract with status consumers and must not
//! change. Tunables are defaults that can be overridden via environment
//! variables, see [`crate::config::ControllerConfig`].

/// API group of the operator's custom resources
pub const API_GROUP: &str = "nim.opendatahub.io";

/// API version of the operator's custom resources
pub const API_VERSION: &str = "v1alpha1";

/// Finalizer recorded on Accounts, Apps and Runtimes before any dependent is created
pub const FINALIZER: &str = "nim.opendatahub.io/cleanup_finalizer";

/// Label that opts a credential Secret into App orchestration
pub const NIM_APP_LABEL: &str = "nim.opendatahub.io/nim-app";

/// Label stamped on resources derived from an Account, valued with the Account name
pub const NIM_ACCOUNT_LABEL: &str = "nim.opendatahub.io/nim-account";

/// Name given to Apps created on behalf of a labeled credential Secret
pub const DEFAULT_APP_NAME: &str = "odh-nim-app";

/// Field manager used for every write the operator issues
pub const FIELD_MANAGER: &str = "nim-operator";

/// Secret data key holding the NGC API key
pub const API_KEY_SECRET_KEY: &str = "api_key";

/// Environment variable carrying the NGC API key inside the serving runtime
pub const NGC_API_KEY_ENV: &str = "NGC_API_KEY";

/// Name of the serving component inside the DataScienceCluster status
pub const KSERVE_COMPONENT: &str = "kserve";

/// DataScienceCluster phase that counts as ready
pub const DSC_READY_PHASE: &str = "Ready";

/// Condition types written on Accounts
pub mod account_conditions {
    pub const KSERVE_READINESS: &str = "KServeReadiness";
    pub const API_KEY_VALIDATION: &str = "APIKeyValidation";
    pub const TEMPLATE_UPDATE: &str = "TemplateUpdate";
    pub const CONFIGMAP_UPDATE: &str = "ConfigMapUpdate";
}

/// Condition types written on Apps
pub mod app_conditions {
    pub const API_KEY_VALIDATED: &str = "ApiKeyValidated";
    pub const CONTENT_UPDATED: &str = "ContentUpdated";
}

/// Condition types written on Runtimes, one per provisioning stage
pub mod runtime_conditions {
    pub const PVC: &str = "PVCReconciled";
    pub const IMAGE_PULL_SECRET: &str = "ImagePullSecretReconciled";
    pub const NIM_SECRET: &str = "NimSecretReconciled";
    pub const SERVING_RUNTIME: &str = "ServingRuntimeReconciled";
    pub const INFERENCE_SERVICE: &str = "InferenceReconciledCreation";
}

/// Condition reasons shared by all reconcilers
pub mod reasons {
    pub const KSERVE_READY: &str = "KServeReady";
    pub const KSERVE_NOT_READY: &str = "KServeNotReady";
    pub const API_KEY_AVAILABLE: &str = "ApiKeyAvailable";
    pub const API_KEY_VALID: &str = "ApiKeyValid";
    pub const API_KEY_INVALID: &str = "ApiKeyInvalid";
    pub const API_KEY_MISSING: &str = "ApiKeyMissing";
    pub const SECRET_REF_MISSING: &str = "SecretRefMissing";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const SECRET_LABEL_REMOVED: &str = "SecretLabelRemoved";
    pub const VALIDATION_ERROR: &str = "ValidationError";
    pub const CONTENT_FETCHED: &str = "ContentFetched";
    pub const FETCH_FAILED: &str = "FetchFailed";
    pub const RECONCILED: &str = "Reconciled";
    pub const DIVERGED: &str = "Diverged";
    pub const FOREIGN_OWNER: &str = "ForeignOwner";
    pub const ACCOUNT_NOT_READY: &str = "AccountNotReady";
    pub const MODEL_NOT_SPECIFIED: &str = "ModelNotSpecified";
    pub const MODEL_NOT_FOUND: &str = "ModelNotFound";
    pub const TEMPLATE_RENDER_FAILED: &str = "TemplateRenderFailed";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const FAILED: &str = "Failed";
}

/// Readiness gate reasons
pub mod gate_reasons {
    pub const READY: &str = "Ready";
    pub const NOT_FOUND: &str = "NotFound";
    pub const PHASE_NOT_READY: &str = "PhaseNotReady";
    pub const COMPONENT_NOT_INSTALLED: &str = "ComponentNotInstalled";
}

/// Default namespace the operator runs in
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "opendatahub";

/// Default address for the Prometheus metrics endpoint
pub const DEFAULT_METRICS_ADDRESS: &str = ":8080";

/// Default address for the health and readiness probes
pub const DEFAULT_PROBE_ADDRESS: &str = ":8081";

/// Default base URL of the NGC API
pub const DEFAULT_NGC_API_BASE_URL: &str = "https://api.ngc.nvidia.com";

/// Default catalog query used to discover NIM images
pub const DEFAULT_NGC_CATALOG_QUERY: &str =
    r#"{"query":"orgName:nim","fields":["name","displayName","latestTag","description","updatedDate"],"page":0,"pageSize":1000}"#;

/// Default timeout for a single NGC API request (seconds)
pub const DEFAULT_NGC_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default requeue interval while the serving subsystem is not ready (seconds)
pub const DEFAULT_NOT_READY_REQUEUE_SECS: u64 = 60;

/// Default periodic resync for healthy objects (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Requeue delay used for "re-queue now" outcomes (milliseconds)
pub const IMMEDIATE_REQUEUE_MS: u64 = 500;

/// Default Fibonacci backoff minimum for failed reconciles (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;

/// Default Fibonacci backoff maximum for failed reconciles (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Default schedule of the content refresh and key revalidation CronJobs
pub const DEFAULT_CRONJOB_SCHEDULE: &str = "0 0 * * *";

/// Default image used by the CronJobs to patch the App
pub const DEFAULT_CRONJOB_IMAGE: &str = "registry.redhat.io/openshift4/ose-cli:latest";

/// Default service account the CronJobs run as
pub const DEFAULT_CRONJOB_SERVICE_ACCOUNT: &str = "odh-nim-operator-cron";

/// Default registry NIM images are pulled from
pub const DEFAULT_SERVING_IMAGE_REGISTRY: &str = "nvcr.io";

/// Time controllers get to finish in-flight reconciles after a shutdown signal (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 20;

/// Default Lease name for leader election
pub const DEFAULT_LEADER_ELECTION_LEASE_NAME: &str = "odh-nim-leader-election-id";

/// Leader election lease duration (seconds)
pub const LEADER_LEASE_DURATION_SECS: u64 = 30;

/// Leader election renew interval (seconds)
pub const LEADER_RENEW_INTERVAL_SECS: u64 = 10;

/// Leader election retry interval while standing by (seconds)
pub const LEADER_RETRY_INTERVAL_SECS: u64 = 5;
