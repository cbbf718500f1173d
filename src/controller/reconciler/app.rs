//! # App Reconciler
//!
//! Drives an `OdhNimApp` through credential validation and catalog content
//! sync.
//!
//! ## Reconciliation Flow
//!
//! 1. Fetch the App; a missing App is a no-op
//! 2. Deleting: tear down owned dependents, drop the finalizer, stop
//! 3. Record the finalizer before anything else is created, then requeue
//! 4. `apiKey.validate`: validate the key, write `ApiKeyValidated`, then clear the flag
//! 5. Create the serving Template once and bind `templateRef`
//! 6. Refresh catalog content when asked to (or never fetched), bind `configMapRef`;
//!    a failed fetch leaves `content.update` set for the retry
//! 7. Ensure the CronJob that periodically sets `content.update`
//!
//! Status is always written before the spec flag it answers, so a crash in
//! between re-runs the step instead of skipping it.

use super::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use super::types::{requeue_on_conflict, Outcome, Reconciler, ReconcilerError};
use crate::constants::{app_conditions, reasons};
use crate::controller::conditions::{find_condition, set_condition};
use crate::controller::dependents::{
    api_key_from_secret, app_config_map_name, app_patch_cronjob, app_template_name,
    catalog_config_map, content_refresh_job_name, revalidation_job_name, serving_template,
};
use crate::controller::ngc::NgcError;
use crate::controller::store::ObjectStore;
use crate::controller::sync::{self, SyncError};
use crate::crd::{Condition, ConditionStatus, NimApp, NimAppStatus, ResourceRef, Template};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Reconcile the App `namespace/name`.
///
/// Conflicting writes are reported as [`Outcome::Requeue`], never as errors.
///
/// # Errors
///
/// Store failures and external (NGC) failures; the caller backs off.
pub async fn reconcile_app<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    requeue_on_conflict(reconcile_app_inner(ctx, namespace, name).await)
}

async fn reconcile_app_inner<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    let store = &ctx.store;

    let Some(mut app) = store.get::<NimApp>(namespace, name).await? else {
        debug!(resource.namespace = namespace, resource.name = name, "App not found, nothing to do");
        return Ok(Outcome::Done);
    };

    if app.meta().deletion_timestamp.is_some() {
        if has_finalizer(&app) {
            teardown_app(ctx, &app).await?;
            remove_finalizer(store, &app).await?;
            info!(resource.namespace = namespace, resource.name = name, "App finalized");
        }
        return Ok(Outcome::Done);
    }

    if !has_finalizer(&app) {
        add_finalizer(store, &app).await?;
        return Ok(Outcome::Requeue);
    }

    // Step 4: credential validation
    let validate_requested = app.spec.api_key.validate;
    if validate_requested {
        let (condition, verdict) = validate_credential(ctx, &app).await?;
        app = write_condition(store, app, condition).await?;
        if let Verdict::Failed(e) = verdict {
            // The flag stays set so the backoff retry validates again.
            return Err(e.into());
        }
        app.spec.api_key.validate = false;
        app = store.replace(&app).await?;
    }

    let validation_failed = app
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, app_conditions::API_KEY_VALIDATED))
        .is_some_and(|c| c.status == ConditionStatus::False);
    if validation_failed && ctx.config.halt_on_validation_failure {
        debug!(resource.namespace = namespace, resource.name = name, "API key not valid, halting");
        return Ok(Outcome::Done);
    }

    // Step 5: serving template, created once
    if app.spec.template_ref.is_none() {
        let template = serving_template(&app_template_name(name), &BTreeMap::new());
        let ensured = sync::ensure_exists(store, &app, template).await?;
        app.spec.template_ref = Some(ensured.reference);
        app = store.replace(&app).await?;
    }

    // Step 6: catalog content
    if validate_requested || app.spec.content.update || app.spec.content.config_map_ref.is_none() {
        app = refresh_content(ctx, app).await?;
    }

    // Step 7: periodic content refresh
    let job = app_patch_cronjob(
        &content_refresh_job_name(name),
        name,
        namespace,
        &json!({ "spec": { "content": { "update": true } } }),
        &ctx.config.cronjob_settings(),
    );
    ensure_cronjob(store, &app, job).await?;

    Ok(Outcome::Done)
}

/// Result of a credential check
enum Verdict {
    Valid,
    Invalid,
    /// NGC could not be reached; no verdict either way
    Failed(NgcError),
}

/// Check the bound credential. Store failures are returned as errors; NGC
/// failures become [`Verdict::Failed`] so the condition can record them.
async fn validate_credential<S: ObjectStore>(
    ctx: &Reconciler<S>,
    app: &NimApp,
) -> Result<(Condition, Verdict), ReconcilerError> {
    let namespace = app.meta().namespace.as_deref().unwrap_or_default();
    let invalid = |reason: &str, message: String| {
        (
            Condition::new(app_conditions::API_KEY_VALIDATED, ConditionStatus::False, reason, message),
            Verdict::Invalid,
        )
    };

    let Some(secret_ref) = app.spec.api_key.secret_ref.as_ref() else {
        return Ok(invalid(reasons::SECRET_REF_MISSING, "no API key secret is bound".to_string()));
    };
    let secret_namespace = secret_ref.namespace_or(namespace);
    let Some(secret) = ctx.store.get::<Secret>(secret_namespace, &secret_ref.name).await? else {
        return Ok(invalid(
            reasons::SECRET_NOT_FOUND,
            format!("secret {secret_namespace}/{} not found", secret_ref.name),
        ));
    };
    let Some(api_key) = api_key_from_secret(&secret) else {
        return Ok(invalid(
            reasons::API_KEY_MISSING,
            format!("secret {secret_namespace}/{} has no api_key", secret_ref.name),
        ));
    };

    Ok(match ctx.ngc.validate_api_key(&api_key).await {
        Ok(true) => (
            Condition::new(app_conditions::API_KEY_VALIDATED, ConditionStatus::True, reasons::API_KEY_VALID, "API key accepted by NGC"),
            Verdict::Valid,
        ),
        Ok(false) => invalid(reasons::API_KEY_INVALID, "API key rejected by NGC".to_string()),
        Err(e) => {
            warn!(error = %e, "API key validation could not reach NGC");
            (
                Condition::new(app_conditions::API_KEY_VALIDATED, ConditionStatus::Unknown, reasons::VALIDATION_ERROR, e.to_string()),
                Verdict::Failed(e),
            )
        }
    })
}

async fn refresh_content<S: ObjectStore>(ctx: &Reconciler<S>, mut app: NimApp) -> Result<NimApp, ReconcilerError> {
    let store = &ctx.store;
    let name = app.name_any();

    let catalog = match ctx.ngc.fetch_catalog().await {
        Ok(catalog) => catalog,
        Err(e) => {
            let condition = Condition::new(app_conditions::CONTENT_UPDATED, ConditionStatus::False, reasons::FETCH_FAILED, e.to_string());
            let mut app = write_condition(store, app, condition).await?;
            // A refresh requested by validation has no flag of its own; record
            // it so the backoff retry fetches again.
            if !app.spec.content.update {
                app.spec.content.update = true;
                store.replace(&app).await?;
            }
            return Err(e.into());
        }
    };

    let desired = catalog_config_map(
        &app_config_map_name(&name),
        &BTreeMap::new(),
        &catalog,
        &ctx.config.serving_image_registry,
    );
    let ensured = match sync::ensure_exists(store, &app, desired.clone()).await {
        Ok(ensured) => ensured,
        Err(e @ SyncError::ForeignOwner { .. }) => {
            warn!(error = %e, "Content ConfigMap is owned by another resource");
            let condition = Condition::new(app_conditions::CONTENT_UPDATED, ConditionStatus::False, reasons::FOREIGN_OWNER, e.to_string());
            write_condition(store, app, condition).await?;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    if ensured.diverged {
        sync::refresh::<_, _, ConfigMap>(store, &app, &ensured.reference, desired).await?;
    }

    let condition = Condition::new(
        app_conditions::CONTENT_UPDATED,
        ConditionStatus::True,
        reasons::CONTENT_FETCHED,
        format!("{} NIM images available", catalog.entries.len()),
    );
    app = write_condition(store, app, condition).await?;

    let mut spec_changed = false;
    if app.spec.content.update {
        app.spec.content.update = false;
        spec_changed = true;
    }
    if app.spec.content.config_map_ref.is_none() {
        app.spec.content.config_map_ref = Some(ensured.reference);
        spec_changed = true;
    }
    if spec_changed {
        app = store.replace(&app).await?;
    }
    Ok(app)
}

/// Upsert `condition` and write status when it changed; returns the stored App.
pub(crate) async fn write_condition<S: ObjectStore>(store: &S, app: NimApp, condition: Condition) -> Result<NimApp, ReconcilerError> {
    let mut status: NimAppStatus = app.status.clone().unwrap_or_default();
    if !set_condition(&mut status.conditions, condition) {
        return Ok(app);
    }
    let mut updated = app;
    updated.status = Some(status);
    Ok(store.replace_status(&updated).await?)
}

/// Ensure a CronJob owned by `app`, overwriting a diverged one with the
/// configured schedule and image.
pub(crate) async fn ensure_cronjob<S: ObjectStore>(store: &S, app: &NimApp, job: CronJob) -> Result<(), ReconcilerError> {
    let ensured = sync::ensure_exists(store, app, job.clone()).await?;
    if ensured.diverged {
        sync::refresh(store, app, &ensured.reference, job).await?;
    }
    Ok(())
}

/// Delete everything an App owns. Relies on deterministic names so that
/// dependents are found even when their reference was never persisted;
/// objects the App does not control are left alone.
pub(crate) async fn teardown_app<S: ObjectStore>(ctx: &Reconciler<S>, app: &NimApp) -> Result<(), ReconcilerError> {
    let store = &ctx.store;
    let name = app.name_any();
    let namespace = app.meta().namespace.clone().unwrap_or_default();

    let template = app
        .spec
        .template_ref
        .clone()
        .unwrap_or_else(|| ResourceRef::named(app_template_name(&name), &namespace));
    let config_map = app
        .spec
        .content
        .config_map_ref
        .clone()
        .unwrap_or_else(|| ResourceRef::named(app_config_map_name(&name), &namespace));

    sync::delete::<_, _, Template>(store, app, &template).await?;
    sync::delete::<_, _, ConfigMap>(store, app, &config_map).await?;
    for job in [content_refresh_job_name(&name), revalidation_job_name(&name)] {
        sync::delete::<_, _, CronJob>(store, app, &ResourceRef::named(job, &namespace)).await?;
    }
    Ok(())
}
