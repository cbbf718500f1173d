//! # NIM Operator
//!
//! A Kubernetes operator that provisions NVIDIA NIM model serving on Open
//! Data Hub.
//!
//! ## Overview
//!
//! - **Account** (`OdhNIMAccount`) - binds the cluster to an NGC API key once
//!   KServe is ready; owns the serving template and the model catalog
//! - **App** (`OdhNimApp`) - validates the key and keeps catalog content fresh
//!   for a namespace, driven by a labeled credential Secret
//! - **Runtime** (`OdhNIMRuntime`) - one model deployment: storage, pull and
//!   NIM secrets, a `ServingRuntime` and an `InferenceService`
//!
//! ## Usage
//!
//! ```bash
//! nim-operator --leader-elect --enable-webhooks
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use nim_operator::runtime::dispatch::{controllers, shutdown_signal, start_all};
use nim_operator::runtime::initialization::initialize;
use nim_operator::runtime::leader::LeaderElector;
use nim_operator::runtime::Args;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let init = initialize(&args).await?;
    let controllers = controllers(&init.client, &init.reconciler);

    if !args.leader_elect {
        start_all(controllers, init.server_state).await;
        return Ok(());
    }

    let config = &init.reconciler.config;
    let elector = Arc::new(LeaderElector::new(
        init.client.clone(),
        &config.leader_election_lease_name,
        &config.operator_namespace,
        &LeaderElector::default_identity(),
    ));

    let mut guard = tokio::select! {
        guard = elector.acquire() => guard,
        () = shutdown_signal() => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
    };

    let lost = tokio::select! {
        () = start_all(controllers, Arc::clone(&init.server_state)) => false,
        () = guard.lost() => true,
    };
    if lost {
        init.server_state.set_ready(false);
        bail!("leader lease lost, exiting so a standby can take over");
    }
    if let Err(e) = guard.release().await {
        warn!(error = %e, "Failed to release leader lease");
    }
    Ok(())
}
