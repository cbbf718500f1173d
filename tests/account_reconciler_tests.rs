//! Account reconciler and readiness gate tests

mod common;

use common::{account, context, credential, dsc, healthy_ngc, ngc_unavailable, ready_dsc, MemoryStore, MockNgc, Write, NS};
use k8s_openapi::api::core::v1::ConfigMap;
use nim_operator::constants::{account_conditions, gate_reasons, reasons, NIM_ACCOUNT_LABEL};
use nim_operator::controller::conditions::find_condition;
use nim_operator::controller::readiness;
use nim_operator::controller::reconciler::{reconcile_account, Outcome, Reconciler, ReconcilerError};
use nim_operator::controller::store::ObjectStore;
use nim_operator::controller::sync::SyncError;
use nim_operator::crd::{ConditionStatus, DataScienceCluster, NimAccount, Template};
use std::collections::BTreeMap;
use std::time::Duration;

fn seeded(ngc: MockNgc) -> Reconciler<MemoryStore> {
    let ctx = context(ngc);
    ctx.store.seed(&credential("ngc-key", NS, false));
    ctx.store.seed(&account("acct", "ngc-key"));
    ctx.store.seed_cluster(&ready_dsc());
    ctx
}

async fn settle(ctx: &Reconciler<MemoryStore>) -> Result<Outcome, ReconcilerError> {
    for _ in 0..5 {
        match reconcile_account(ctx, NS, "acct").await? {
            Outcome::Requeue => continue,
            outcome => return Ok(outcome),
        }
    }
    panic!("Account did not settle");
}

fn condition_of(account: &NimAccount, r#type: &str) -> (ConditionStatus, String) {
    let status = account.status.as_ref().expect("Account has no status");
    let c = find_condition(&status.conditions, r#type).unwrap_or_else(|| panic!("no {} condition", r#type));
    (c.status, c.reason.clone().unwrap_or_default())
}

#[tokio::test]
async fn test_ready_gate_derives_template_and_config_map() {
    let ctx = seeded(healthy_ngc());

    let outcome = settle(&ctx).await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(600)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    let status = stored.status.clone().unwrap();
    assert_eq!(status.template_ref.unwrap().name, "acct-template");
    assert_eq!(status.config_map_ref.unwrap().name, "acct-data");
    for r#type in [
        account_conditions::KSERVE_READINESS,
        account_conditions::API_KEY_VALIDATION,
        account_conditions::TEMPLATE_UPDATE,
        account_conditions::CONFIGMAP_UPDATE,
    ] {
        assert_eq!(condition_of(&stored, r#type).0, ConditionStatus::True, "{} should be True", r#type);
    }

    let template: Template = ctx.store.fetch(NS, "acct-template").unwrap();
    assert_eq!(
        template.metadata.labels,
        Some(BTreeMap::from([(NIM_ACCOUNT_LABEL.to_string(), "acct".to_string())]))
    );
    assert!(ctx.store.exists::<ConfigMap>(NS, "acct-data"));
}

#[tokio::test]
async fn test_steady_state_writes_nothing() {
    let ctx = seeded(healthy_ngc());
    settle(&ctx).await.unwrap();
    let writes = ctx.store.writes();

    settle(&ctx).await.unwrap();

    assert_eq!(ctx.store.writes(), writes);
}

#[tokio::test]
async fn test_missing_cluster_holds_the_account() {
    let ctx = context(MockNgc::new());
    ctx.store.seed(&credential("ngc-key", NS, false));
    ctx.store.seed(&account("acct", "ngc-key"));

    let outcome = reconcile_account(&ctx, NS, "acct").await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(60)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    assert_eq!(
        condition_of(&stored, account_conditions::KSERVE_READINESS),
        (ConditionStatus::False, reasons::KSERVE_NOT_READY.to_string())
    );
    assert_eq!(
        condition_of(&stored, account_conditions::API_KEY_VALIDATION),
        (ConditionStatus::Unknown, reasons::KSERVE_NOT_READY.to_string())
    );
    assert!(stored.status.as_ref().unwrap().template_ref.is_none());
    assert_eq!(ctx.store.count::<Template>(NS), 0);
}

#[tokio::test]
async fn test_losing_readiness_tears_down_derived_resources() {
    let ctx = seeded(healthy_ngc());
    settle(&ctx).await.unwrap();
    assert!(ctx.store.exists::<Template>(NS, "acct-template"));

    ctx.store.seed_cluster(&dsc("Progressing", true));
    let outcome = reconcile_account(&ctx, NS, "acct").await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(60)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    let status = stored.status.clone().unwrap();
    assert!(status.template_ref.is_none());
    assert!(status.config_map_ref.is_none());
    assert!(!ctx.store.exists::<Template>(NS, "acct-template"));
    assert!(!ctx.store.exists::<ConfigMap>(NS, "acct-data"));
    assert_eq!(
        condition_of(&stored, account_conditions::TEMPLATE_UPDATE),
        (ConditionStatus::False, reasons::KSERVE_NOT_READY.to_string())
    );

    // Readiness comes back: everything is derived again.
    ctx.store.seed_cluster(&ready_dsc());
    settle(&ctx).await.unwrap();
    assert!(ctx.store.exists::<Template>(NS, "acct-template"));
    assert!(ctx.store.exists::<ConfigMap>(NS, "acct-data"));
}

#[tokio::test]
async fn test_missing_credential_is_reported() {
    let ctx = context(MockNgc::new());
    ctx.store.seed(&account("acct", "absent"));
    ctx.store.seed_cluster(&ready_dsc());

    let outcome = settle(&ctx).await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(60)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    assert_eq!(
        condition_of(&stored, account_conditions::API_KEY_VALIDATION),
        (ConditionStatus::False, reasons::SECRET_NOT_FOUND.to_string())
    );
    assert_eq!(ctx.store.count::<Template>(NS), 0);
}

#[tokio::test]
async fn test_foreign_config_map_is_left_alone() {
    let ctx = seeded(healthy_ngc());
    let squatter = ConfigMap {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("acct-data".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("keep".to_string(), "me".to_string())])),
        ..ConfigMap::default()
    };
    ctx.store.seed(&squatter);

    let err = settle(&ctx).await.unwrap_err();

    assert!(matches!(err, ReconcilerError::Sync(SyncError::ForeignOwner { .. })));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    assert_eq!(
        condition_of(&stored, account_conditions::CONFIGMAP_UPDATE),
        (ConditionStatus::False, reasons::FOREIGN_OWNER.to_string())
    );
    let untouched: ConfigMap = ctx.store.fetch(NS, "acct-data").unwrap();
    assert_eq!(untouched.data.unwrap().get("keep").map(String::as_str), Some("me"));
}

#[tokio::test]
async fn test_catalog_failure_is_an_error() {
    let mut ngc = MockNgc::new();
    ngc.expect_fetch_catalog()
        .returning(|| Err(ngc_unavailable("catalog")));
    let ctx = seeded(ngc);

    let err = settle(&ctx).await.unwrap_err();

    assert!(matches!(err, ReconcilerError::Ngc(_)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    assert_eq!(
        condition_of(&stored, account_conditions::CONFIGMAP_UPDATE),
        (ConditionStatus::False, reasons::FETCH_FAILED.to_string())
    );
}

#[tokio::test]
async fn test_status_conflict_requeues() {
    let ctx = seeded(healthy_ngc());
    assert_eq!(reconcile_account(&ctx, NS, "acct").await.unwrap(), Outcome::Requeue);

    ctx.store.inject_conflicts(Write::ReplaceStatus, 1);

    assert_eq!(reconcile_account(&ctx, NS, "acct").await.unwrap(), Outcome::Requeue);
    assert!(settle(&ctx).await.is_ok());
}

#[tokio::test]
async fn test_deletion_removes_derived_resources() {
    let ctx = seeded(healthy_ngc());
    settle(&ctx).await.unwrap();

    ctx.store.delete::<NimAccount>(NS, "acct").await.unwrap();
    assert_eq!(reconcile_account(&ctx, NS, "acct").await.unwrap(), Outcome::Done);

    assert!(!ctx.store.exists::<NimAccount>(NS, "acct"));
    assert!(!ctx.store.exists::<Template>(NS, "acct-template"));
    assert!(!ctx.store.exists::<ConfigMap>(NS, "acct-data"));
}

#[tokio::test]
async fn test_readiness_gate_reasons() {
    let store = MemoryStore::default();
    let gate = readiness::is_ready(&store).await.unwrap();
    assert!(!gate.ready);
    assert_eq!(gate.reason, gate_reasons::NOT_FOUND);

    store.seed_cluster(&dsc("Progressing", true));
    assert_eq!(readiness::is_ready(&store).await.unwrap().reason, gate_reasons::PHASE_NOT_READY);

    store.seed_cluster(&dsc("Ready", false));
    assert_eq!(
        readiness::is_ready(&store).await.unwrap().reason,
        gate_reasons::COMPONENT_NOT_INSTALLED
    );

    store.seed_cluster(&ready_dsc());
    assert!(readiness::is_ready(&store).await.unwrap().ready);

    store.remove_cluster::<DataScienceCluster>("default-dsc");
    assert!(!readiness::is_ready(&store).await.unwrap().ready);
}

#[tokio::test]
async fn test_readiness_query_failure_is_recorded_and_returned() {
    let ctx = seeded(MockNgc::new());
    ctx.store.fail_cluster_lists(1);

    let err = reconcile_account(&ctx, NS, "acct").await.unwrap_err();

    assert!(matches!(err, ReconcilerError::Readiness(_)));
    let stored: NimAccount = ctx.store.fetch(NS, "acct").unwrap();
    assert_eq!(
        condition_of(&stored, account_conditions::KSERVE_READINESS),
        (ConditionStatus::False, reasons::KSERVE_NOT_READY.to_string())
    );
    assert_eq!(ctx.store.count::<Template>(NS), 0);
}

#[tokio::test]
async fn test_tombstone_status_conflict_requeues() {
    let ctx = seeded(healthy_ngc());
    settle(&ctx).await.unwrap();
    ctx.store.seed_cluster(&dsc("Progressing", true));

    ctx.store.inject_conflicts(Write::ReplaceStatus, 1);
    assert_eq!(reconcile_account(&ctx, NS, "acct").await.unwrap(), Outcome::Requeue);
    // Nothing is deleted until the cleared references are recorded.
    assert!(ctx.store.exists::<Template>(NS, "acct-template"));

    let outcome = reconcile_account(&ctx, NS, "acct").await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(60)));
    assert!(!ctx.store.exists::<Template>(NS, "acct-template"));
    assert!(!ctx.store.exists::<ConfigMap>(NS, "acct-data"));
}

#[tokio::test]
async fn test_deletion_keeps_a_config_map_it_does_not_own() {
    let ctx = seeded(healthy_ngc());
    let squatter = ConfigMap {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("acct-data".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        ..ConfigMap::default()
    };
    ctx.store.seed(&squatter);
    assert!(settle(&ctx).await.is_err());

    ctx.store.delete::<NimAccount>(NS, "acct").await.unwrap();
    assert_eq!(reconcile_account(&ctx, NS, "acct").await.unwrap(), Outcome::Done);

    assert!(!ctx.store.exists::<NimAccount>(NS, "acct"));
    assert!(!ctx.store.exists::<Template>(NS, "acct-template"));
    assert!(ctx.store.exists::<ConfigMap>(NS, "acct-data"));
}
