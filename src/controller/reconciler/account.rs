//! # Account Reconciler
//!
//! Keeps an `OdhNIMAccount`'s derived Template and catalog ConfigMap in step
//! with the serving subsystem.
//!
//! While KServe is not ready the Account is held in a tombstone state: every
//! condition reports `KServeNotReady`, both references are cleared and the
//! derived resources are deleted. Nothing derived from an Account outlives
//! the gate.

use super::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use super::types::{requeue_on_conflict, Outcome, Reconciler, ReconcilerError};
use crate::constants::{account_conditions, reasons};
use crate::controller::conditions::set_condition;
use crate::controller::dependents::{
    account_config_map_name, account_labels, account_template_name, api_key_from_secret,
    catalog_config_map, serving_template,
};
use crate::controller::readiness;
use crate::controller::store::ObjectStore;
use crate::controller::sync::{self, SyncError};
use crate::crd::{Condition, ConditionStatus, NimAccount, NimAccountStatus, ResourceRef, Template};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

/// Reconcile the Account `namespace/name`.
///
/// # Errors
///
/// Readiness query failures, store failures and catalog fetch failures.
pub async fn reconcile_account<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    requeue_on_conflict(reconcile_account_inner(ctx, namespace, name).await)
}

async fn reconcile_account_inner<S: ObjectStore>(
    ctx: &Reconciler<S>,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcilerError> {
    let store = &ctx.store;

    let Some(mut account) = store.get::<NimAccount>(namespace, name).await? else {
        debug!(resource.namespace = namespace, resource.name = name, "Account not found, nothing to do");
        return Ok(Outcome::Done);
    };

    if account.meta().deletion_timestamp.is_some() {
        if has_finalizer(&account) {
            delete_derived(ctx, &account).await?;
            remove_finalizer(store, &account).await?;
            info!(resource.namespace = namespace, resource.name = name, "Account finalized");
        }
        return Ok(Outcome::Done);
    }

    let gate = match readiness::is_ready(store).await {
        Ok(gate) => gate,
        Err(e) => {
            let mut status = account.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                Condition::new(account_conditions::KSERVE_READINESS, ConditionStatus::False, reasons::KSERVE_NOT_READY, e.to_string()),
            );
            if let Err(write_err) = write_status(store, &account, status).await {
                warn!(error = %write_err, "Failed to record readiness query failure");
            }
            return Err(ReconcilerError::Readiness(e));
        }
    };

    if !gate.ready {
        return tombstone(ctx, account, gate.reason).await;
    }

    if !has_finalizer(&account) {
        add_finalizer(store, &account).await?;
        return Ok(Outcome::Requeue);
    }

    let mut status = account.status.clone().unwrap_or_default();

    // Credential
    let credential = check_credential(ctx, &account).await?;
    let credential_ok = credential.status == ConditionStatus::True;
    set_condition(&mut status.conditions, credential);
    if !credential_ok {
        write_status(store, &account, status).await?;
        return Ok(Outcome::RequeueAfter(ctx.config.not_ready_requeue()));
    }

    // Template
    let template = serving_template(&account_template_name(name), &account_labels(name));
    let template_ref = match sync::ensure_exists(store, &account, template).await {
        Ok(ensured) => {
            let reason = if ensured.diverged { reasons::DIVERGED } else { reasons::RECONCILED };
            set_condition(
                &mut status.conditions,
                Condition::new(account_conditions::TEMPLATE_UPDATE, ConditionStatus::True, reason, format!("template {}", ensured.reference)),
            );
            ensured.reference
        }
        Err(e @ SyncError::ForeignOwner { .. }) => {
            warn!(error = %e, "Account template is owned by another resource");
            set_condition(
                &mut status.conditions,
                Condition::new(account_conditions::TEMPLATE_UPDATE, ConditionStatus::False, reasons::FOREIGN_OWNER, e.to_string()),
            );
            write_status(store, &account, status).await?;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    // Catalog ConfigMap
    let catalog = match ctx.ngc.fetch_catalog().await {
        Ok(catalog) => catalog,
        Err(e) => {
            set_condition(
                &mut status.conditions,
                Condition::new(account_conditions::CONFIGMAP_UPDATE, ConditionStatus::False, reasons::FETCH_FAILED, e.to_string()),
            );
            write_status(store, &account, status).await?;
            return Err(e.into());
        }
    };
    let desired = catalog_config_map(
        &account_config_map_name(name),
        &account_labels(name),
        &catalog,
        &ctx.config.serving_image_registry,
    );
    let config_map_ref = match sync::ensure_exists(store, &account, desired.clone()).await {
        Ok(ensured) => {
            if ensured.diverged {
                sync::refresh(store, &account, &ensured.reference, desired).await?;
            }
            set_condition(
                &mut status.conditions,
                Condition::new(
                    account_conditions::CONFIGMAP_UPDATE,
                    ConditionStatus::True,
                    reasons::RECONCILED,
                    format!("{} NIM images available", catalog.entries.len()),
                ),
            );
            ensured.reference
        }
        Err(e @ SyncError::ForeignOwner { .. }) => {
            warn!(error = %e, "Account ConfigMap is owned by another resource");
            set_condition(
                &mut status.conditions,
                Condition::new(account_conditions::CONFIGMAP_UPDATE, ConditionStatus::False, reasons::FOREIGN_OWNER, e.to_string()),
            );
            write_status(store, &account, status).await?;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    set_condition(
        &mut status.conditions,
        Condition::new(account_conditions::KSERVE_READINESS, ConditionStatus::True, reasons::KSERVE_READY, "KServe is ready"),
    );
    status.template_ref = Some(template_ref);
    status.config_map_ref = Some(config_map_ref);
    account = write_status(store, &account, status).await?;
    debug!(resource.namespace = namespace, resource.name = name, rv = ?account.meta().resource_version, "Account reconciled");

    Ok(Outcome::RequeueAfter(ctx.config.resync_interval()))
}

/// Gate not ready: record the tombstone, clear the references, then delete
/// what they pointed at.
async fn tombstone<S: ObjectStore>(
    ctx: &Reconciler<S>,
    account: NimAccount,
    gate_reason: &str,
) -> Result<Outcome, ReconcilerError> {
    let message = format!("KServe is not ready: {gate_reason}");
    let mut status = account.status.clone().unwrap_or_default();
    for (r#type, condition_status) in [
        (account_conditions::KSERVE_READINESS, ConditionStatus::False),
        (account_conditions::API_KEY_VALIDATION, ConditionStatus::Unknown),
        (account_conditions::TEMPLATE_UPDATE, ConditionStatus::False),
        (account_conditions::CONFIGMAP_UPDATE, ConditionStatus::False),
    ] {
        set_condition(
            &mut status.conditions,
            Condition::new(r#type, condition_status, reasons::KSERVE_NOT_READY, message.clone()),
        );
    }
    status.template_ref = None;
    status.config_map_ref = None;

    write_status(&ctx.store, &account, status).await?;
    // `account` still carries the references that were just cleared.
    delete_derived(ctx, &account).await?;
    debug!(resource.name = %account.name_any(), reason = gate_reason, "KServe not ready, Account held");

    Ok(Outcome::RequeueAfter(ctx.config.not_ready_requeue()))
}

/// `APIKeyValidation` condition for the Account's credential Secret.
async fn check_credential<S: ObjectStore>(ctx: &Reconciler<S>, account: &NimAccount) -> Result<Condition, ReconcilerError> {
    let namespace = account.meta().namespace.as_deref().unwrap_or_default();
    let secret_ref = &account.spec.secret_ref;
    let secret_namespace = secret_ref.namespace_or(namespace);
    let condition = |status, reason: &str, message: String| {
        Condition::new(account_conditions::API_KEY_VALIDATION, status, reason, message)
    };

    let Some(secret) = ctx.store.get::<Secret>(secret_namespace, &secret_ref.name).await? else {
        return Ok(condition(
            ConditionStatus::False,
            reasons::SECRET_NOT_FOUND,
            format!("secret {secret_namespace}/{} not found", secret_ref.name),
        ));
    };
    Ok(match api_key_from_secret(&secret) {
        Some(_) => condition(ConditionStatus::True, reasons::API_KEY_AVAILABLE, "API key available".to_string()),
        None => condition(
            ConditionStatus::False,
            reasons::API_KEY_MISSING,
            format!("secret {secret_namespace}/{} has no api_key", secret_ref.name),
        ),
    })
}

/// Delete the Template and ConfigMap the Account controls, by recorded
/// reference or derived name.
async fn delete_derived<S: ObjectStore>(ctx: &Reconciler<S>, account: &NimAccount) -> Result<(), ReconcilerError> {
    let name = account.name_any();
    let namespace = account.meta().namespace.clone().unwrap_or_default();
    let status = account.status.clone().unwrap_or_default();

    let template = status
        .template_ref
        .unwrap_or_else(|| ResourceRef::named(account_template_name(&name), &namespace));
    let config_map = status
        .config_map_ref
        .unwrap_or_else(|| ResourceRef::named(account_config_map_name(&name), &namespace));

    sync::delete::<_, _, Template>(&ctx.store, account, &template).await?;
    sync::delete::<_, _, ConfigMap>(&ctx.store, account, &config_map).await?;
    Ok(())
}

/// Write `status` when it differs from what the Account carries; returns the
/// stored Account.
async fn write_status<S: ObjectStore>(
    store: &S,
    account: &NimAccount,
    status: NimAccountStatus,
) -> Result<NimAccount, ReconcilerError> {
    if account.status.as_ref() == Some(&status) {
        return Ok(account.clone());
    }
    let mut updated = account.clone();
    updated.status = Some(status);
    Ok(store.replace_status(&updated).await?)
}
