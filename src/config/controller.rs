//! # Controller Configuration
//!
//! Operator-level settings loaded from environment variables.

use crate::controller::dependents::CronJobSettings;
use std::time::Duration;

/// Operator-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace the operator runs in (leader election lease lives here)
    pub operator_namespace: String,
    /// NGC API base URL
    pub ngc_api_base_url: String,
    /// Query sent to the NGC catalog search endpoint
    pub ngc_catalog_query: String,
    /// Timeout for a single NGC request (seconds)
    pub ngc_request_timeout_secs: u64,
    /// Requeue interval while the serving subsystem or an Account is not ready (seconds)
    pub not_ready_requeue_secs: u64,
    /// Periodic resync for healthy objects (seconds)
    pub resync_interval_secs: u64,
    /// Fibonacci backoff minimum for failed reconciles (seconds)
    pub backoff_min_secs: u64,
    /// Fibonacci backoff maximum for failed reconciles (seconds)
    pub backoff_max_secs: u64,
    /// Schedule of the content refresh and key revalidation CronJobs
    pub cronjob_schedule: String,
    /// Image the CronJobs run `kubectl patch` from
    pub cronjob_image: String,
    /// Service account the CronJobs run as
    pub cronjob_service_account: String,
    /// Stop an App reconcile after a failed key validation
    /// When false, content sync proceeds even though the key was rejected
    pub halt_on_validation_failure: bool,
    /// Registry NIM images and pull secrets refer to
    pub serving_image_registry: String,
    /// Lease name used for leader election
    pub leader_election_lease_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            ngc_api_base_url: DEFAULT_NGC_API_BASE_URL.to_string(),
            ngc_catalog_query: DEFAULT_NGC_CATALOG_QUERY.to_string(),
            ngc_request_timeout_secs: DEFAULT_NGC_REQUEST_TIMEOUT_SECS,
            not_ready_requeue_secs: DEFAULT_NOT_READY_REQUEUE_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            cronjob_schedule: DEFAULT_CRONJOB_SCHEDULE.to_string(),
            cronjob_image: DEFAULT_CRONJOB_IMAGE.to_string(),
            cronjob_service_account: DEFAULT_CRONJOB_SERVICE_ACCOUNT.to_string(),
            halt_on_validation_failure: true,
            serving_image_registry: DEFAULT_SERVING_IMAGE_REGISTRY.to_string(),
            leader_election_lease_name: DEFAULT_LEADER_ELECTION_LEASE_NAME.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    ///
    /// Unset or unparsable variables fall back to the constants in
    /// [`crate::constants`].
    ///
    /// # Example
    ///
    /// ```
    /// use nim_operator::config::ControllerConfig;
    ///
    /// let config = ControllerConfig::from_env();
    /// println!("Requeue when not ready: {:?}", config.not_ready_requeue());
    /// ```
    #[must_use]
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            operator_namespace: env_var_or_default_str("POD_NAMESPACE", DEFAULT_OPERATOR_NAMESPACE),
            ngc_api_base_url: env_var_or_default_str("NGC_API_BASE_URL", DEFAULT_NGC_API_BASE_URL),
            ngc_catalog_query: env_var_or_default_str("NGC_CATALOG_QUERY", DEFAULT_NGC_CATALOG_QUERY),
            ngc_request_timeout_secs: env_var_or_default(
                "NGC_REQUEST_TIMEOUT_SECS",
                DEFAULT_NGC_REQUEST_TIMEOUT_SECS,
            ),
            not_ready_requeue_secs: env_var_or_default(
                "NOT_READY_REQUEUE_SECS",
                DEFAULT_NOT_READY_REQUEUE_SECS,
            ),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", DEFAULT_BACKOFF_MIN_SECS),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            cronjob_schedule: env_var_or_default_str("CRONJOB_SCHEDULE", DEFAULT_CRONJOB_SCHEDULE),
            cronjob_image: env_var_or_default_str("CRONJOB_IMAGE", DEFAULT_CRONJOB_IMAGE),
            cronjob_service_account: env_var_or_default_str(
                "CRONJOB_SERVICE_ACCOUNT",
                DEFAULT_CRONJOB_SERVICE_ACCOUNT,
            ),
            halt_on_validation_failure: env_var_or_default_bool("HALT_ON_VALIDATION_FAILURE", true),
            serving_image_registry: env_var_or_default_str(
                "SERVING_IMAGE_REGISTRY",
                DEFAULT_SERVING_IMAGE_REGISTRY,
            ),
            leader_election_lease_name: env_var_or_default_str(
                "LEADER_ELECTION_LEASE_NAME",
                DEFAULT_LEADER_ELECTION_LEASE_NAME,
            ),
        }
    }

    /// Get NGC request timeout duration
    #[must_use]
    pub fn ngc_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ngc_request_timeout_secs)
    }

    /// Get not-ready requeue duration
    #[must_use]
    pub fn not_ready_requeue(&self) -> Duration {
        Duration::from_secs(self.not_ready_requeue_secs)
    }

    /// Get resync interval duration
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Settings for the CronJobs that patch Apps
    #[must_use]
    pub fn cronjob_settings(&self) -> CronJobSettings {
        CronJobSettings {
            schedule: self.cronjob_schedule.clone(),
            image: self.cronjob_image.clone(),
            service_account: self.cronjob_service_account.clone(),
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |v| {
            matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
        })
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
