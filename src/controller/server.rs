//! # HTTP Server
//!
//! HTTP servers for metrics, health checks, and Kubernetes probes.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format, on `--metric-address`
//! - `/healthz` - Liveness probe (always returns 200), on `--probe-address`
//! - `/readyz` - Readiness probe (returns 200 once the controllers run), on `--probe-address`
//!
//! With `--enable-webhooks` the admission endpoints are merged into the probe
//! server.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::observability::metrics::REGISTRY;

#[derive(Debug, Default)]
pub struct ServerState {
    pub is_ready: AtomicBool,
}

impl ServerState {
    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ready(&self) -> bool {
        self.is_ready.load(Ordering::Relaxed)
    }
}

#[must_use]
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

/// Probe routes, plus `extra` (the admission webhooks) when given.
#[must_use]
pub fn probe_router(state: Arc<ServerState>, extra: Option<Router>) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);
    let router = match extra {
        Some(extra) => router.merge(extra),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve `router` until the process exits.
///
/// # Errors
///
/// Fails when the address cannot be bound or the server stops with an error.
pub async fn serve(addr: SocketAddr, router: Router) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "HTTP server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
