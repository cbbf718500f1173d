//! End-to-end App lifecycle driven by a labeled credential Secret
//!
//! Secret created → App created and bound → key validated, template and
//! catalog content provisioned, refresh jobs scheduled → Secret deleted →
//! App and everything it owns removed.

mod common;

use common::{context, credential, healthy_ngc, MemoryStore, MODEL, NS};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use nim_operator::constants::{app_conditions, DEFAULT_APP_NAME};
use nim_operator::controller::conditions::is_condition_true;
use nim_operator::controller::reconciler::{reconcile_app, reconcile_secret, Outcome, Reconciler};
use nim_operator::controller::store::ObjectStore;
use nim_operator::crd::{NimApp, ResourceRef, Template};

/// Dependents of the App that may only exist once it carries the finalizer
fn assert_finalizer_precedes_dependents(store: &MemoryStore) {
    assert!(store.owned_by_unfinalized::<Template, NimApp>(NS).is_empty());
    assert!(store.owned_by_unfinalized::<ConfigMap, NimApp>(NS).is_empty());
    assert!(store.owned_by_unfinalized::<CronJob, NimApp>(NS).is_empty());
}

async fn settle_app(ctx: &Reconciler<MemoryStore>, name: &str) {
    for _ in 0..5 {
        let outcome = reconcile_app(ctx, NS, name).await.unwrap();
        assert_finalizer_precedes_dependents(&ctx.store);
        if outcome != Outcome::Requeue {
            return;
        }
    }
    panic!("App {name} did not settle");
}

#[tokio::test]
async fn test_credential_lifecycle_drives_the_app() {
    let ctx = context(healthy_ngc());
    ctx.store.seed(&credential("c1", NS, true));

    // Secret trigger: App created and bound
    assert_eq!(reconcile_secret(&ctx, NS, "c1").await.unwrap(), Outcome::Done);
    assert_finalizer_precedes_dependents(&ctx.store);
    let app: NimApp = ctx.store.fetch(NS, DEFAULT_APP_NAME).unwrap();
    assert_eq!(app.spec.api_key.secret_ref, Some(ResourceRef::named("c1", NS)));
    assert!(app.spec.api_key.validate);

    // App reconciler: validated, provisioned, flags reset
    settle_app(&ctx, DEFAULT_APP_NAME).await;
    let app: NimApp = ctx.store.fetch(NS, DEFAULT_APP_NAME).unwrap();
    let conditions = &app.status.as_ref().unwrap().conditions;
    assert!(is_condition_true(conditions, app_conditions::API_KEY_VALIDATED));
    assert!(is_condition_true(conditions, app_conditions::CONTENT_UPDATED));
    assert!(!app.spec.api_key.validate);
    assert!(!app.spec.content.update);
    let content_ref = app.spec.content.config_map_ref.clone().unwrap();
    let content: ConfigMap = ctx.store.fetch(NS, &content_ref.name).unwrap();
    assert!(content.data.unwrap().contains_key(MODEL));
    assert!(ctx.store.exists::<Template>(NS, &app.spec.template_ref.unwrap().name));
    assert!(ctx.store.exists::<CronJob>(NS, &format!("{DEFAULT_APP_NAME}-content-refresh")));
    assert!(ctx.store.exists::<CronJob>(NS, &format!("{DEFAULT_APP_NAME}-apikey-revalidate")));

    // Credential deleted: App and its scheduled jobs go away
    ctx.store.delete::<Secret>(NS, "c1").await.unwrap();
    assert_eq!(reconcile_secret(&ctx, NS, "c1").await.unwrap(), Outcome::Done);
    assert_eq!(ctx.store.count::<CronJob>(NS), 0);
    assert_eq!(reconcile_app(&ctx, NS, DEFAULT_APP_NAME).await.unwrap(), Outcome::Done);

    assert_eq!(ctx.store.count::<NimApp>(NS), 0);
    assert_eq!(ctx.store.count::<Template>(NS), 0);
    assert_eq!(ctx.store.count::<ConfigMap>(NS), 0);
    assert!(ctx.store.dangling_owner_refs().is_empty());
}

#[tokio::test]
async fn test_relabeling_revalidates_the_same_app() {
    let ctx = context(healthy_ngc());
    ctx.store.seed(&credential("c1", NS, true));
    reconcile_secret(&ctx, NS, "c1").await.unwrap();
    settle_app(&ctx, DEFAULT_APP_NAME).await;

    ctx.store.seed(&credential("c1", NS, false));
    reconcile_secret(&ctx, NS, "c1").await.unwrap();
    let app: NimApp = ctx.store.fetch(NS, DEFAULT_APP_NAME).unwrap();
    assert!(!is_condition_true(&app.status.unwrap().conditions, app_conditions::API_KEY_VALIDATED));

    ctx.store.seed(&credential("c1", NS, true));
    reconcile_secret(&ctx, NS, "c1").await.unwrap();
    settle_app(&ctx, DEFAULT_APP_NAME).await;

    assert_eq!(ctx.store.count::<NimApp>(NS), 1);
    let app: NimApp = ctx.store.fetch(NS, DEFAULT_APP_NAME).unwrap();
    assert!(is_condition_true(&app.status.unwrap().conditions, app_conditions::API_KEY_VALIDATED));
}
