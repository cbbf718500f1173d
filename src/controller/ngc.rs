//! # NGC API
//!
//! The two external calls the operator makes to NVIDIA GPU Cloud: validating
//! an API key and fetching the NIM container catalog.
//!
//! Reconcilers depend on the [`NgcApi`] trait only; [`NgcClient`] is the
//! reqwest implementation.

use crate::observability::metrics;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NgcError {
    #[error("NGC request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("NGC returned unexpected status {status} for {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
    },
}

/// One NIM container image in the NGC catalog
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// `org/team/name` path of the image within the registry
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

/// External NGC capability used by the reconcilers
#[async_trait]
pub trait NgcApi: Send + Sync {
    /// `Ok(true)` when NGC accepts the key, `Ok(false)` when it rejects it.
    async fn validate_api_key(&self, api_key: &str) -> Result<bool, NgcError>;

    async fn fetch_catalog(&self) -> Result<Catalog, NgcError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    resources: Vec<SearchResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResource {
    name: String,
    resource_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    date_modified: Option<String>,
    #[serde(default)]
    attributes: Vec<SearchAttribute>,
}

#[derive(Debug, Deserialize)]
struct SearchAttribute {
    key: String,
    value: String,
}

impl From<SearchResource> for CatalogEntry {
    fn from(r: SearchResource) -> Self {
        let latest_tag = r
            .attributes
            .iter()
            .find(|a| a.key == "latestTag")
            .map(|a| a.value.clone());
        Self {
            name: r.name,
            display_name: r.display_name,
            resource_id: r.resource_id,
            latest_tag,
            description: r.description,
            updated_date: r.date_modified,
        }
    }
}

/// reqwest client for the NGC API
#[derive(Debug, Clone)]
pub struct NgcClient {
    http: reqwest::Client,
    base_url: String,
    catalog_query: String,
}

impl NgcClient {
    /// # Errors
    ///
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(base_url: &str, catalog_query: &str, timeout: Duration) -> Result<Self, NgcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nim-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            catalog_query: catalog_query.to_string(),
        })
    }
}

#[async_trait]
impl NgcApi for NgcClient {
    async fn validate_api_key(&self, api_key: &str) -> Result<bool, NgcError> {
        let url = format!("{}/v3/keys/get-caller-info", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .form(&[("credentials", api_key)])
            .send()
            .await
            .inspect_err(|_| metrics::increment_ngc_calls("validate", "error"))?;

        match response.status() {
            s if s.is_success() => {
                metrics::increment_ngc_calls("validate", "valid");
                Ok(true)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status(), "NGC rejected API key");
                metrics::increment_ngc_calls("validate", "invalid");
                Ok(false)
            }
            s => {
                warn!(status = %s, "Unexpected NGC response while validating API key");
                metrics::increment_ngc_calls("validate", "error");
                Err(NgcError::UnexpectedStatus {
                    operation: "validate",
                    status: s.as_u16(),
                })
            }
        }
    }

    async fn fetch_catalog(&self) -> Result<Catalog, NgcError> {
        let url = format!("{}/v2/search/catalog/resources/CONTAINER", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("q", self.catalog_query.as_str())])
            .send()
            .await
            .inspect_err(|_| metrics::increment_ngc_calls("catalog", "error"))?;

        if !response.status().is_success() {
            metrics::increment_ngc_calls("catalog", "error");
            return Err(NgcError::UnexpectedStatus {
                operation: "catalog",
                status: response.status().as_u16(),
            });
        }

        let body: SearchResponse = response
            .json()
            .await
            .inspect_err(|_| metrics::increment_ngc_calls("catalog", "error"))?;
        let entries: Vec<CatalogEntry> = body
            .results
            .into_iter()
            .flat_map(|r| r.resources)
            .map(CatalogEntry::from)
            .collect();
        debug!(count = entries.len(), "Fetched NIM catalog");
        metrics::increment_ngc_calls("catalog", "ok");
        Ok(Catalog { entries })
    }
}
