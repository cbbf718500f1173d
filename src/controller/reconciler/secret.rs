//! # Secret-Trigger Reconciler
//!
//! Turns the lifecycle of a labeled credential Secret into App lifecycle:
//!
//! - labeled Secret: bind (or create) the namespace's App and request a
//!   validation pass, then ensure the revalidation CronJob
//! - label removed: mark the bound App's credential as not validated
//! - Secret gone: delete the bound App and its CronJobs

use super::app::{ensure_cronjob, write_condition};
use super::types::{requeue_on_conflict, Outcome, Reconciler, ReconcilerError};
use crate::constants::{app_conditions, reasons, DEFAULT_APP_NAME, FINALIZER};
use crate::controller::dependents::{app_patch_cronjob, content_refresh_job_name, revalidation_job_name};
use crate::controller::predicate::is_labeled;
use crate::controller::store::{ObjectStore, StoreError};
use crate::controller::sync;
use crate::crd::{ApiKeySpec, Condition, ConditionStatus, NimApp, NimAppSpec, ResourceRef};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

/// Reconcile the credential Secret `namespace/name`.
///
/// # Errors
///
/// Store failures; the caller backs off.
pub async fn reconcile_secret<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    requeue_on_conflict(reconcile_secret_inner(ctx, namespace, name).await)
}

async fn reconcile_secret_inner<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    let store = &ctx.store;

    let secret = store
        .get::<Secret>(namespace, name)
        .await?
        .filter(|s| s.meta().deletion_timestamp.is_none());
    let apps = store.list::<NimApp>(namespace).await?;
    let (bound, others): (Vec<NimApp>, Vec<NimApp>) = apps
        .into_iter()
        .partition(|app| is_bound_to(app, namespace, name));

    if bound.len() > 1 {
        warn!(resource.namespace = namespace, resource.name = name, apps = bound.len(), "More than one App bound to the same Secret");
    }

    let Some(secret) = secret else {
        for app in &bound {
            delete_app(ctx, app).await?;
        }
        return Ok(Outcome::Done);
    };

    if !is_labeled(secret.meta().labels.as_ref()) {
        for app in bound {
            let condition = Condition::new(
                app_conditions::API_KEY_VALIDATED,
                ConditionStatus::False,
                reasons::SECRET_LABEL_REMOVED,
                format!("secret {namespace}/{name} is no longer labeled for NIM"),
            );
            write_condition(store, app, condition).await?;
        }
        return Ok(Outcome::Done);
    }

    let app = if let Some(app) = bound.into_iter().next() {
        request_validation(store, app, None).await?
    } else if let Some(app) = others
        .iter()
        .find(|app| app.spec.api_key.secret_ref.is_none())
        .cloned()
    {
        info!(resource.namespace = namespace, app = %app.name_any(), secret = name, "Binding existing App to Secret");
        request_validation(store, app, Some(ResourceRef::named(name, namespace))).await?
    } else if let Some(app) = others.first() {
        warn!(
            resource.namespace = namespace,
            app = %app.name_any(),
            secret = name,
            "Namespace already has an App bound to another Secret, leaving it alone"
        );
        return Ok(Outcome::Done);
    } else {
        match store.create(namespace, &new_app(namespace, name)).await {
            Ok(app) => {
                info!(resource.namespace = namespace, app = DEFAULT_APP_NAME, secret = name, "Created App for Secret");
                app
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(resource.namespace = namespace, "App created concurrently, requeueing");
                return Ok(Outcome::Requeue);
            }
            Err(e) => return Err(e.into()),
        }
    };

    let app_name = app.name_any();
    let job = app_patch_cronjob(
        &revalidation_job_name(&app_name),
        &app_name,
        namespace,
        &json!({ "spec": { "apiKey": { "validate": true } } }),
        &ctx.config.cronjob_settings(),
    );
    ensure_cronjob(store, &app, job).await?;

    Ok(Outcome::Done)
}

fn is_bound_to(app: &NimApp, namespace: &str, name: &str) -> bool {
    let app_namespace = app.meta().namespace.as_deref().unwrap_or(namespace);
    app.spec
        .api_key
        .secret_ref
        .as_ref()
        .is_some_and(|r| r.points_at(name, namespace, app_namespace))
}

/// App bound to the Secret, protected by the finalizer from the start.
fn new_app(namespace: &str, secret: &str) -> NimApp {
    let mut app = NimApp::new(
        DEFAULT_APP_NAME,
        NimAppSpec {
            api_key: ApiKeySpec {
                validate: true,
                secret_ref: Some(ResourceRef::named(secret, namespace)),
            },
            ..NimAppSpec::default()
        },
    );
    app.metadata.namespace = Some(namespace.to_string());
    app.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    app
}

/// Set `apiKey.validate`, bind `secret_ref` when given and make sure the
/// finalizer is recorded. Writes only when something changed.
async fn request_validation<S: ObjectStore>(
    store: &S,
    app: NimApp,
    secret_ref: Option<ResourceRef>,
) -> Result<NimApp, ReconcilerError> {
    let mut updated = app.clone();
    updated.spec.api_key.validate = true;
    if let Some(secret_ref) = secret_ref {
        updated.spec.api_key.secret_ref = Some(secret_ref);
    }
    let finalizers = updated.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
    }

    if updated.spec == app.spec && updated.meta().finalizers == app.meta().finalizers {
        return Ok(app);
    }
    Ok(store.replace(&updated).await?)
}

/// Delete the App's CronJobs, then the App itself. The App's finalizer
/// takes care of the rest of its dependents.
async fn delete_app<S: ObjectStore>(ctx: &Reconciler<S>, app: &NimApp) -> Result<(), ReconcilerError> {
    let name = app.name_any();
    let namespace = app.meta().namespace.clone().unwrap_or_default();

    for job in [revalidation_job_name(&name), content_refresh_job_name(&name)] {
        sync::delete::<_, _, CronJob>(&ctx.store, app, &ResourceRef::named(job, &namespace)).await?;
    }
    match ctx.store.delete::<NimApp>(&namespace, &name).await {
        Ok(()) => {
            info!(resource.namespace = %namespace, resource.name = %name, "Deleted App after its Secret was removed");
            Ok(())
        }
        Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
