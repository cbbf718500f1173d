//! # Initialization
//!
//! Operator start-up: rustls setup, tracing, metrics, the HTTP servers,
//! the Kubernetes client and the shared reconciler context.

use crate::config::ControllerConfig;
use crate::controller::admission::admission_routes;
use crate::controller::ngc::NgcClient;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{metrics_router, probe_router, serve, ServerState};
use crate::controller::store::KubeStore;
use crate::observability;
use crate::runtime::Args;
use anyhow::{Context, Result};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything the dispatch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler<KubeStore>>,
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("reconciler", &self.reconciler)
            .field("server_ready", &self.server_state.ready())
            .finish_non_exhaustive()
    }
}

/// Initialize the operator runtime.
///
/// # Errors
///
/// Fails when metrics cannot be registered, no Kubernetes client can be
/// built or the NGC client cannot be created.
pub async fn initialize(args: &Args) -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection.
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    init_tracing(args.debug);
    if !provider_installed {
        warn!("A rustls crypto provider was already installed, keeping it");
    }

    info!("Starting NIM operator");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let config = ControllerConfig::from_env();
    info!(
        operator_namespace = %config.operator_namespace,
        ngc_api = %config.ngc_api_base_url,
        resync_secs = config.resync_interval_secs,
        halt_on_validation_failure = config.halt_on_validation_failure,
        "Loaded operator configuration"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = KubeStore::new(client.clone());
    let ngc = NgcClient::new(
        &config.ngc_api_base_url,
        &config.ngc_catalog_query,
        config.ngc_request_timeout(),
    )
    .context("Failed to create NGC client")?;

    let server_state = Arc::new(ServerState::default());
    spawn_server("metrics", args.metric_address, metrics_router());
    let admission = args.enable_webhooks.then(|| {
        info!("Admission webhooks enabled");
        admission_routes(store.clone())
    });
    spawn_server(
        "probe",
        args.probe_address,
        probe_router(Arc::clone(&server_state), admission),
    );

    let reconciler = Arc::new(Reconciler::new(store, Arc::new(ngc), config));
    info!("Operator initialized, starting controllers...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
    })
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("nim_operator=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "nim_operator=info".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_server(name: &'static str, addr: SocketAddr, router: axum::Router) {
    tokio::spawn(async move {
        if let Err(e) = serve(addr, router).await {
            error!(server = name, address = %addr, error = %e, "HTTP server error");
        }
    });
}
