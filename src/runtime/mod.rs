//! # Runtime
//!
//! Process runtime: command-line flags, initialization, leader election, the
//! controller dispatch loops and their error policy.

pub mod dispatch;
pub mod error_policy;
pub mod initialization;
pub mod leader;

use crate::constants::{DEFAULT_METRICS_ADDRESS, DEFAULT_PROBE_ADDRESS};
use clap::Parser;
use std::net::SocketAddr;

/// Open Data Hub NIM operator
#[derive(Parser, Debug, Clone)]
#[command(name = "nim-operator")]
#[command(about = "Kubernetes operator provisioning NVIDIA NIM on Open Data Hub", long_about = None)]
pub struct Args {
    /// The address the metric endpoint binds to
    #[arg(long = "metric-address", default_value = DEFAULT_METRICS_ADDRESS, value_parser = parse_address)]
    pub metric_address: SocketAddr,

    /// The address the probe endpoint binds to
    #[arg(long = "probe-address", default_value = DEFAULT_PROBE_ADDRESS, value_parser = parse_address)]
    pub probe_address: SocketAddr,

    /// Enable leader election, ensuring only one active operator
    #[arg(long = "leader-elect")]
    pub leader_elect: bool,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Serve the validating admission webhooks on the probe address
    #[arg(long = "enable-webhooks")]
    pub enable_webhooks: bool,
}

/// Parse a listen address; a bare `:port` binds all interfaces.
///
/// # Errors
///
/// Returns a message when the address is not `host:port` or `:port`.
pub fn parse_address(value: &str) -> Result<SocketAddr, String> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address {value:?}: {e}"))
}
