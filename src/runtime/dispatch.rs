//! # Dispatch
//!
//! Routes cluster change notifications to the reconcilers.
//!
//! The set of controllers is an explicit list built by [`controllers`] and
//! handed to [`start_all`]; nothing registers itself globally.
//!
//! - Account, App and Runtime run as kube-runtime `Controller`s, woken by
//!   their own objects and by the dependents they own
//! - credential Secrets have no owner to map back to, so a dedicated watcher
//!   filters events through [`predicate::passes`] and feeds a work queue
//!
//! [`predicate::passes`]: crate::controller::predicate::passes

use crate::constants::SHUTDOWN_GRACE_PERIOD_SECS;
use crate::controller::predicate::{self, SecretEventKind};
use crate::controller::reconciler::{
    reconcile_account, reconcile_app, reconcile_runtime, reconcile_secret, Outcome, Reconciler,
    ReconcilerError,
};
use crate::controller::server::ServerState;
use crate::controller::store::KubeStore;
use crate::crd::{NimAccount, NimApp, NimRuntime};
use crate::runtime::error_policy::{handle_reconciliation_error, instrumented, retry_delay};
use futures::future::BoxFuture;
use futures::{pin_mut, FutureExt, StreamExt};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Error as ControllerError};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller, WatchStreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const ACCOUNT_CONTROLLER: &str = "account";
pub const APP_CONTROLLER: &str = "app";
pub const RUNTIME_CONTROLLER: &str = "runtime";
pub const SECRET_CONTROLLER: &str = "secret";

type Context = Reconciler<KubeStore>;

/// A controller ready to be driven by [`start_all`]
pub struct NamedController {
    pub name: &'static str,
    pub run: BoxFuture<'static, ()>,
}

impl std::fmt::Debug for NamedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedController")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The operator's controllers, in start order.
#[must_use]
pub fn controllers(client: &Client, ctx: &Arc<Context>) -> Vec<NamedController> {
    vec![
        NamedController {
            name: ACCOUNT_CONTROLLER,
            run: account_controller(client.clone(), Arc::clone(ctx)),
        },
        NamedController {
            name: APP_CONTROLLER,
            run: app_controller(client.clone(), Arc::clone(ctx)),
        },
        NamedController {
            name: SECRET_CONTROLLER,
            run: secret_controller(client.clone(), Arc::clone(ctx)),
        },
        NamedController {
            name: RUNTIME_CONTROLLER,
            run: runtime_controller(client.clone(), Arc::clone(ctx)),
        },
    ]
}

/// Drive every controller until they stop or a shutdown signal arrives.
///
/// The probe server reports ready while the controllers run. On shutdown the
/// controllers get a grace period to finish in-flight reconciles.
pub async fn start_all(controllers: Vec<NamedController>, state: Arc<ServerState>) {
    let names: Vec<&str> = controllers.iter().map(|c| c.name).collect();
    info!(controllers = ?names, "Starting controllers");

    let runs = futures::future::join_all(controllers.into_iter().map(|controller| async move {
        controller.run.await;
        info!(controller = controller.name, "Controller stopped");
    }));
    pin_mut!(runs);

    state.set_ready(true);
    tokio::select! {
        _ = &mut runs => {
            warn!("All controllers stopped");
        }
        () = shutdown_signal() => {
            info!("Received shutdown signal, waiting for in-flight reconciliations to complete...");
            state.set_ready(false);
            let grace = Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS);
            if tokio::time::timeout(grace, &mut runs).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "Controllers did not stop within the grace period");
            }
        }
    }
    state.set_ready(false);
    info!("Controllers stopped gracefully");
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

type ControllerEvent<K> = Result<(ObjectRef<K>, Action), ControllerError<ReconcilerError, watcher::Error>>;

/// Log the controller stream. Reconcile failures are already reported by the
/// error policy.
fn report<K>(controller: &'static str) -> impl Fn(ControllerEvent<K>) -> futures::future::Ready<()>
where
    K: kube::Resource<DynamicType = ()>,
{
    move |result| {
        match result {
            Ok((object, _)) => debug!(controller, object = %object, "Reconciled"),
            Err(ControllerError::ReconcilerFailed(..)) => {}
            Err(e) => warn!(controller, error = %e, "Controller stream error"),
        }
        futures::future::ready(())
    }
}

fn account_controller(client: Client, ctx: Arc<Context>) -> BoxFuture<'static, ()> {
    Controller::new(Api::<NimAccount>::all(client.clone()), watcher::Config::default().any_semantic())
        .owns(Api::<ConfigMap>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |account, ctx| async move {
                let (namespace, name) = (account.namespace().unwrap_or_default(), account.name_any());
                instrumented(ACCOUNT_CONTROLLER, &*ctx, &namespace, &name, reconcile_account(&*ctx, &namespace, &name))
                    .await
                    .map(Outcome::into_action)
            },
            |account, error, ctx| handle_reconciliation_error(ACCOUNT_CONTROLLER, &account, error, &ctx),
            ctx,
        )
        .for_each(report(ACCOUNT_CONTROLLER))
        .boxed()
}

fn app_controller(client: Client, ctx: Arc<Context>) -> BoxFuture<'static, ()> {
    Controller::new(Api::<NimApp>::all(client.clone()), watcher::Config::default().any_semantic())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
        .owns(Api::<CronJob>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |app, ctx| async move {
                let (namespace, name) = (app.namespace().unwrap_or_default(), app.name_any());
                instrumented(APP_CONTROLLER, &*ctx, &namespace, &name, reconcile_app(&*ctx, &namespace, &name))
                    .await
                    .map(Outcome::into_action)
            },
            |app, error, ctx| handle_reconciliation_error(APP_CONTROLLER, &app, error, &ctx),
            ctx,
        )
        .for_each(report(APP_CONTROLLER))
        .boxed()
}

fn runtime_controller(client: Client, ctx: Arc<Context>) -> BoxFuture<'static, ()> {
    Controller::new(Api::<NimRuntime>::all(client.clone()), watcher::Config::default().any_semantic())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |runtime, ctx| async move {
                let (namespace, name) = (runtime.namespace().unwrap_or_default(), runtime.name_any());
                instrumented(RUNTIME_CONTROLLER, &*ctx, &namespace, &name, reconcile_runtime(&*ctx, &namespace, &name))
                    .await
                    .map(Outcome::into_action)
            },
            |runtime, error, ctx| handle_reconciliation_error(RUNTIME_CONTROLLER, &runtime, error, &ctx),
            ctx,
        )
        .for_each(report(RUNTIME_CONTROLLER))
        .boxed()
}

/// `namespace/name` of a Secret queued for reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretKey {
    pub namespace: String,
    pub name: String,
}

impl SecretKey {
    fn of(secret: &Secret) -> Self {
        Self {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
        }
    }
}

/// Labels of the labeled Secrets seen so far, used to classify the next
/// event for each of them and to spot deletions missed across a re-list.
#[derive(Debug, Default)]
pub struct SecretLabelCache {
    labeled: HashMap<SecretKey, BTreeMap<String, String>>,
    relisting: Option<HashSet<SecretKey>>,
}

impl SecretLabelCache {
    /// Keys a watch event should enqueue.
    pub fn observe(&mut self, event: watcher::Event<Secret>) -> Vec<SecretKey> {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(secret) => {
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(SecretKey::of(&secret));
                }
                self.apply(&secret)
            }
            watcher::Event::Apply(secret) => self.apply(&secret),
            watcher::Event::Delete(secret) => {
                let key = SecretKey::of(&secret);
                self.labeled.remove(&key);
                if predicate::passes(SecretEventKind::Delete, None, secret.metadata.labels.as_ref()) {
                    vec![key]
                } else {
                    Vec::new()
                }
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let mut gone: Vec<SecretKey> = self
                    .labeled
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.sort();
                for key in &gone {
                    self.labeled.remove(key);
                }
                gone
            }
        }
    }

    fn apply(&mut self, secret: &Secret) -> Vec<SecretKey> {
        let key = SecretKey::of(secret);
        let labels = secret.metadata.labels.as_ref();
        let previous = if predicate::is_labeled(labels) {
            self.labeled.insert(key.clone(), labels.cloned().unwrap_or_default())
        } else {
            self.labeled.remove(&key)
        };
        let kind = if previous.is_some() {
            SecretEventKind::Update
        } else {
            SecretEventKind::Create
        };
        if predicate::passes(kind, previous.as_ref(), labels) {
            vec![key]
        } else {
            Vec::new()
        }
    }
}

fn secret_controller(client: Client, ctx: Arc<Context>) -> BoxFuture<'static, ()> {
    async move {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::select! {
            () = watch_secrets(client, tx.clone()) => {
                warn!("Secret watch stream ended");
            }
            () = secret_worker(ctx, tx, rx) => {}
            () = shutdown_signal() => {}
        }
    }
    .boxed()
}

async fn watch_secrets(client: Client, tx: mpsc::UnboundedSender<SecretKey>) {
    let secrets: Api<Secret> = Api::all(client);
    info!("Starting watch for labeled credential Secrets across all namespaces");

    let stream = watcher(secrets, watcher::Config::default()).default_backoff();
    pin_mut!(stream);

    let mut cache = SecretLabelCache::default();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for key in cache.observe(event) {
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Error watching Secrets"),
        }
    }
}

async fn secret_worker(
    ctx: Arc<Context>,
    tx: mpsc::UnboundedSender<SecretKey>,
    mut rx: mpsc::UnboundedReceiver<SecretKey>,
) {
    while let Some(key) = rx.recv().await {
        let SecretKey { namespace, name } = &key;
        let result = instrumented(SECRET_CONTROLLER, &*ctx, namespace, name, reconcile_secret(&*ctx, namespace, name)).await;
        let delay = match result {
            Ok(outcome) => outcome.delay(),
            Err(e) => Some(retry_delay(SECRET_CONTROLLER, &ctx.backoff, namespace, name, &e)),
        };
        if let Some(delay) = delay {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(key);
            });
        }
    }
}
