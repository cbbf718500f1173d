//! # Admission
//!
//! Validating admission rules for the operator's resources.
//!
//! - at most one `OdhNimApp` per namespace
//! - `OdhNIMAccount` and `OdhNIMRuntime` are created and deleted by system
//!   actors only (the operator and cluster components), never directly by users
//!
//! The rules are plain functions; [`admission_routes`] serves them as
//! `AdmissionReview` endpoints when webhooks are enabled.

use crate::controller::store::ObjectStore;
use crate::crd::NimApp;
use axum::{extract::State, routing::post, Json, Router};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const APP_WEBHOOK_PATH: &str = "/validate-nim-opendatahub-io-v1alpha1-odhnimapp";
pub const ACCOUNT_WEBHOOK_PATH: &str = "/validate-nim-opendatahub-io-v1alpha1-odhnimaccount";
pub const RUNTIME_WEBHOOK_PATH: &str = "/validate-nim-opendatahub-io-v1alpha1-odhnimruntime";

/// Prefix of Kubernetes usernames that belong to the control plane or to
/// service accounts
const SYSTEM_USER_PREFIX: &str = "system:";

/// Reject a new App when `existing` already holds one for `namespace`.
///
/// # Errors
///
/// The denial message.
pub fn validate_app_create(namespace: &str, existing: &[NimApp]) -> Result<(), String> {
    if existing.is_empty() {
        Ok(())
    } else {
        Err(format!("an OdhNimApp instance already exists in {namespace}"))
    }
}

/// Reject `operation` on `kind` unless `username` is a system actor.
///
/// # Errors
///
/// The denial message.
pub fn validate_system_actor(kind: &str, operation: &str, username: Option<&str>) -> Result<(), String> {
    match username {
        Some(user) if user.starts_with(SYSTEM_USER_PREFIX) => Ok(()),
        other => Err(format!(
            "{kind} objects are managed by the platform; {operation} by {} is not allowed",
            other.unwrap_or("an anonymous user")
        )),
    }
}

/// Shared state of the admission handlers
#[derive(Debug)]
pub struct AdmissionState<S> {
    pub store: S,
}

/// Router serving the three validating webhooks.
pub fn admission_routes<S: ObjectStore>(store: S) -> Router {
    Router::new()
        .route(APP_WEBHOOK_PATH, post(app_handler::<S>))
        .route(ACCOUNT_WEBHOOK_PATH, post(account_handler))
        .route(RUNTIME_WEBHOOK_PATH, post(runtime_handler))
        .with_state(Arc::new(AdmissionState { store }))
}

fn parse(review: AdmissionReview<DynamicObject>) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    TryInto::<AdmissionRequest<DynamicObject>>::try_into(review).map_err(|e| {
        error!(error = %e, "Failed to parse admission request");
        AdmissionResponse::invalid(e.to_string())
    })
}

fn respond(request: &AdmissionRequest<DynamicObject>, verdict: Result<(), String>) -> AdmissionResponse {
    match verdict {
        Ok(()) => AdmissionResponse::from(request),
        Err(reason) => {
            info!(uid = %request.uid, kind = %request.kind.kind, reason = %reason, "Admission denied");
            AdmissionResponse::from(request).deny(reason)
        }
    }
}

/// Review an App request against the store.
pub async fn review_app<S: ObjectStore>(store: &S, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    if !matches!(request.operation, Operation::Create) {
        return AdmissionResponse::from(request);
    }
    let namespace = request.namespace.clone().unwrap_or_default();
    let verdict = match store.list::<NimApp>(&namespace).await {
        Ok(existing) => validate_app_create(&namespace, &existing),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => {
            error!(error = %e, "Failed to list Apps for admission");
            return AdmissionResponse::invalid(e.to_string());
        }
    };
    debug!(resource.namespace = %namespace, allowed = verdict.is_ok(), "Reviewed App creation");
    respond(request, verdict)
}

/// Review an Account or Runtime request.
#[must_use]
pub fn review_system_managed(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let operation = match request.operation {
        Operation::Create => "create",
        Operation::Delete => "delete",
        _ => return AdmissionResponse::from(request),
    };
    let verdict = validate_system_actor(&request.kind.kind, operation, request.user_info.username.as_deref());
    respond(request, verdict)
}

async fn app_handler<S: ObjectStore>(
    State(state): State<Arc<AdmissionState<S>>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match parse(review) {
        Ok(request) => review_app(&state.store, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

async fn account_handler(Json(review): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    let response = match parse(review) {
        Ok(request) => review_system_managed(&request),
        Err(response) => response,
    };
    Json(response.into_review())
}

async fn runtime_handler(Json(review): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    account_handler(Json(review)).await
}
