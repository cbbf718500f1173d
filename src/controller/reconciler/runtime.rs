//! # Runtime Reconciler
//!
//! Provisions a NIM deployment from an `OdhNIMRuntime` in five stages, each
//! reported through its own condition:
//!
//! 1. `PVCReconciled` - model cache claim
//! 2. `ImagePullSecretReconciled` - registry credential built from the Account's key
//! 3. `NimSecretReconciled` - `NGC_API_KEY` for the serving container
//! 4. `ServingRuntimeReconciled` - instantiated from the Account's Template
//! 5. `InferenceReconciledCreation` - the user's inference service, bound to the runtime
//!
//! A failed stage stops the pipeline; later stages keep their previous
//! condition. Status (conditions and the five references) is written once at
//! the end of a pass.

use super::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use super::types::{requeue_on_conflict, Outcome, Reconciler, ReconcilerError};
use crate::constants::{reasons, runtime_conditions};
use crate::controller::conditions::set_condition;
use crate::controller::dependents::{
    api_key_from_secret, image_for_model, image_pull_secret, inference_service, nim_secret,
    requested_model, runtime_nim_secret_name, runtime_pull_secret_name, runtime_pvc_name,
    serving_runtime, storage_claim, template_params,
};
use crate::controller::store::ObjectStore;
use crate::controller::sync::{self, DependentResource, SyncError};
use crate::crd::{
    Condition, ConditionStatus, InferenceService, NimAccount, NimRuntime, NimRuntimeStatus,
    ResourceRef, ServingRuntime, Template,
};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const STAGES: [&str; 5] = [
    runtime_conditions::PVC,
    runtime_conditions::IMAGE_PULL_SECRET,
    runtime_conditions::NIM_SECRET,
    runtime_conditions::SERVING_RUNTIME,
    runtime_conditions::INFERENCE_SERVICE,
];

/// Reconcile the Runtime `namespace/name`.
///
/// # Errors
///
/// Store failures; the caller backs off.
pub async fn reconcile_runtime<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    requeue_on_conflict(reconcile_runtime_inner(ctx, namespace, name).await)
}

async fn reconcile_runtime_inner<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    let store = &ctx.store;

    let Some(runtime) = store.get::<NimRuntime>(namespace, name).await? else {
        debug!(resource.namespace = namespace, resource.name = name, "Runtime not found, nothing to do");
        return Ok(Outcome::Done);
    };

    if runtime.meta().deletion_timestamp.is_some() {
        if has_finalizer(&runtime) {
            teardown_runtime(ctx, &runtime).await?;
            remove_finalizer(store, &runtime).await?;
            info!(resource.namespace = namespace, resource.name = name, "Runtime finalized");
        }
        return Ok(Outcome::Done);
    }

    if !has_finalizer(&runtime) {
        add_finalizer(store, &runtime).await?;
        return Ok(Outcome::Requeue);
    }

    let mut status = runtime.status.clone().unwrap_or_default();

    let account_namespace = runtime.spec.account_ref.namespace_or(namespace);
    let account = store
        .get::<NimAccount>(account_namespace, &runtime.spec.account_ref.name)
        .await?
        .filter(|a| {
            a.status
                .as_ref()
                .is_some_and(|s| s.template_ref.is_some() && s.config_map_ref.is_some())
        });
    let Some(account) = account else {
        let message = format!("account {account_namespace}/{} is not ready", runtime.spec.account_ref.name);
        for stage in STAGES {
            set_condition(
                &mut status.conditions,
                Condition::new(stage, ConditionStatus::False, reasons::ACCOUNT_NOT_READY, message.clone()),
            );
        }
        write_status(store, &runtime, status).await?;
        return Ok(Outcome::RequeueAfter(ctx.config.not_ready_requeue()));
    };

    let provisioned = match provision(ctx, &runtime, &account, &mut status).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            if let Err(write_err) = write_status(store, &runtime, status).await {
                warn!(error = %write_err, "Failed to record Runtime progress");
            }
            return Err(e);
        }
    };
    write_status(store, &runtime, status).await?;

    Ok(if provisioned {
        Outcome::RequeueAfter(ctx.config.resync_interval())
    } else {
        Outcome::RequeueAfter(ctx.config.not_ready_requeue())
    })
}

/// Run the stages in order; `Ok(false)` when one of them failed.
async fn provision<S: ObjectStore>(
    ctx: &Reconciler<S>,
    runtime: &NimRuntime,
    account: &NimAccount,
    status: &mut NimRuntimeStatus,
) -> Result<bool, ReconcilerError> {
    let store = &ctx.store;
    let name = runtime.name_any();

    // PVC
    let pvc_name = runtime_pvc_name(&name);
    let claim = storage_claim(&pvc_name, &runtime.spec.pvc_spec);
    let Some(pvc_ref) = stage(store, runtime, runtime_conditions::PVC, claim, false, &mut status.conditions).await? else {
        return Ok(false);
    };
    status.pvc_ref = Some(pvc_ref);

    // Both secrets are built from the Account's key
    let api_key = match account_api_key(ctx, account).await? {
        Ok(key) => key,
        Err((reason, message)) => {
            fail(&mut status.conditions, runtime_conditions::IMAGE_PULL_SECRET, reason, message);
            return Ok(false);
        }
    };

    let pull_secret_name = runtime_pull_secret_name(&name);
    let pull_secret = image_pull_secret(&pull_secret_name, &ctx.config.serving_image_registry, &api_key);
    let Some(pull_ref) = stage(store, runtime, runtime_conditions::IMAGE_PULL_SECRET, pull_secret, true, &mut status.conditions).await? else {
        return Ok(false);
    };
    status.image_pull_secret_ref = Some(pull_ref);

    let nim_secret_name = runtime_nim_secret_name(&name);
    let secret = nim_secret(&nim_secret_name, &api_key);
    let Some(nim_ref) = stage(store, runtime, runtime_conditions::NIM_SECRET, secret, true, &mut status.conditions).await? else {
        return Ok(false);
    };
    status.nim_secret_ref = Some(nim_ref);

    // ServingRuntime
    let Some(model) = requested_model(&runtime.spec.inference_service_spec) else {
        fail(
            &mut status.conditions,
            runtime_conditions::SERVING_RUNTIME,
            reasons::MODEL_NOT_SPECIFIED,
            "inferenceServiceSpec.predictor.model.modelFormat.name is not set".to_string(),
        );
        return Ok(false);
    };
    let Some(image) = model_image(ctx, account, model).await? else {
        fail(
            &mut status.conditions,
            runtime_conditions::SERVING_RUNTIME,
            reasons::MODEL_NOT_FOUND,
            format!("model {model} is not in the NIM catalog"),
        );
        return Ok(false);
    };
    let values = BTreeMap::from([
        (template_params::NIM_NAME.to_string(), model.to_string()),
        (template_params::NIM_IMAGE.to_string(), image),
        (template_params::NIM_SECRET.to_string(), nim_secret_name),
        (template_params::NIM_PVC.to_string(), pvc_name),
        (template_params::PULL_SECRET.to_string(), pull_secret_name),
    ]);
    let rendered = account_template(ctx, account)
        .await?
        .and_then(|template| template.render_first(&values))
        .and_then(|object| serving_runtime(&name, &object));
    let Some(desired_runtime) = rendered else {
        fail(
            &mut status.conditions,
            runtime_conditions::SERVING_RUNTIME,
            reasons::TEMPLATE_RENDER_FAILED,
            "the Account template could not be rendered".to_string(),
        );
        return Ok(false);
    };
    let Some(runtime_ref) = stage(store, runtime, runtime_conditions::SERVING_RUNTIME, desired_runtime, false, &mut status.conditions).await? else {
        return Ok(false);
    };
    status.serving_runtime_ref = Some(runtime_ref);

    // InferenceService
    let Some(service) = inference_service(&name, &runtime.spec.inference_service_spec, &name) else {
        fail(
            &mut status.conditions,
            runtime_conditions::INFERENCE_SERVICE,
            reasons::INVALID_SPEC,
            "inferenceServiceSpec has no predictor.model".to_string(),
        );
        return Ok(false);
    };
    let Some(service_ref) = stage(store, runtime, runtime_conditions::INFERENCE_SERVICE, service, false, &mut status.conditions).await? else {
        return Ok(false);
    };
    status.inference_service_ref = Some(service_ref);

    Ok(true)
}

/// Ensure one dependent and record its condition. `refresh` overwrites a
/// diverged object instead of reporting it.
///
/// Returns `Ok(None)` when the stage failed and its condition says why.
async fn stage<S: ObjectStore, K: DependentResource>(
    store: &S,
    runtime: &NimRuntime,
    condition_type: &str,
    desired: K,
    refresh: bool,
    conditions: &mut Vec<Condition>,
) -> Result<Option<ResourceRef>, ReconcilerError> {
    let ensured = match sync::ensure_exists(store, runtime, desired.clone()).await {
        Ok(ensured) => ensured,
        Err(e @ SyncError::ForeignOwner { .. }) => {
            warn!(error = %e, stage = condition_type, "Runtime dependent is owned by another resource");
            fail(conditions, condition_type, reasons::FOREIGN_OWNER, e.to_string());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let reason = match (ensured.diverged, refresh) {
        (true, true) => {
            sync::refresh(store, runtime, &ensured.reference, desired).await?;
            reasons::RECONCILED
        }
        (true, false) => reasons::DIVERGED,
        (false, _) => reasons::RECONCILED,
    };
    set_condition(
        conditions,
        Condition::new(condition_type, ConditionStatus::True, reason, format!("{} {}", K::kind(&()), ensured.reference)),
    );
    Ok(Some(ensured.reference))
}

fn fail(conditions: &mut Vec<Condition>, condition_type: &str, reason: &str, message: String) {
    debug!(stage = condition_type, reason, "Runtime stage failed");
    set_condition(
        conditions,
        Condition::new(condition_type, ConditionStatus::False, reason, message),
    );
}

/// The Account's NGC key, or the `(reason, message)` explaining why it is
/// unavailable.
async fn account_api_key<S: ObjectStore>(
    ctx: &Reconciler<S>,
    account: &NimAccount,
) -> Result<Result<Zeroizing<String>, (&'static str, String)>, ReconcilerError> {
    let account_namespace = account.meta().namespace.as_deref().unwrap_or_default();
    let secret_ref = &account.spec.secret_ref;
    let namespace = secret_ref.namespace_or(account_namespace);
    let Some(secret) = ctx.store.get::<Secret>(namespace, &secret_ref.name).await? else {
        return Ok(Err((reasons::SECRET_NOT_FOUND, format!("secret {namespace}/{} not found", secret_ref.name))));
    };
    Ok(api_key_from_secret(&secret)
        .ok_or_else(|| (reasons::API_KEY_MISSING, format!("secret {namespace}/{} has no api_key", secret_ref.name))))
}

async fn account_template<S: ObjectStore>(ctx: &Reconciler<S>, account: &NimAccount) -> Result<Option<Template>, ReconcilerError> {
    let account_namespace = account.meta().namespace.as_deref().unwrap_or_default();
    let Some(reference) = account.status.as_ref().and_then(|s| s.template_ref.as_ref()) else {
        return Ok(None);
    };
    Ok(ctx
        .store
        .get::<Template>(reference.namespace_or(account_namespace), &reference.name)
        .await?)
}

/// Image for `model` from the Account's catalog ConfigMap.
async fn model_image<S: ObjectStore>(ctx: &Reconciler<S>, account: &NimAccount, model: &str) -> Result<Option<String>, ReconcilerError> {
    let account_namespace = account.meta().namespace.as_deref().unwrap_or_default();
    let Some(reference) = account.status.as_ref().and_then(|s| s.config_map_ref.as_ref()) else {
        return Ok(None);
    };
    let config_map = ctx
        .store
        .get::<ConfigMap>(reference.namespace_or(account_namespace), &reference.name)
        .await?;
    Ok(config_map.and_then(|cm| image_for_model(&cm, model)))
}

/// Delete the five dependents the Runtime controls, by recorded reference or
/// derived name.
async fn teardown_runtime<S: ObjectStore>(ctx: &Reconciler<S>, runtime: &NimRuntime) -> Result<(), ReconcilerError> {
    let store = &ctx.store;
    let name = runtime.name_any();
    let namespace = runtime.meta().namespace.clone().unwrap_or_default();
    let status = runtime.status.clone().unwrap_or_default();
    let or_named = |reference: Option<ResourceRef>, derived: String| {
        reference.unwrap_or_else(|| ResourceRef::named(derived, &namespace))
    };

    sync::delete::<_, _, InferenceService>(store, runtime, &or_named(status.inference_service_ref, name.clone())).await?;
    sync::delete::<_, _, ServingRuntime>(store, runtime, &or_named(status.serving_runtime_ref, name.clone())).await?;
    sync::delete::<_, _, Secret>(store, runtime, &or_named(status.nim_secret_ref, runtime_nim_secret_name(&name))).await?;
    sync::delete::<_, _, Secret>(store, runtime, &or_named(status.image_pull_secret_ref, runtime_pull_secret_name(&name))).await?;
    sync::delete::<_, _, PersistentVolumeClaim>(store, runtime, &or_named(status.pvc_ref, runtime_pvc_name(&name))).await?;
    Ok(())
}

async fn write_status<S: ObjectStore>(
    store: &S,
    runtime: &NimRuntime,
    status: NimRuntimeStatus,
) -> Result<NimRuntime, ReconcilerError> {
    if runtime.status.as_ref() == Some(&status) {
        return Ok(runtime.clone());
    }
    let mut updated = runtime.clone();
    updated.status = Some(status);
    Ok(store.replace_status(&updated).await?)
}
