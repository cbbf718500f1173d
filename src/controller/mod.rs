//! # Controller
//!
//! Core controller modules for the NIM operator.
//!
//! - `admission`: Validating admission rules and their webhook endpoints
//! - `backoff`: Fibonacci backoff for failed reconciles
//! - `conditions`: Condition tracker
//! - `dependents`: Builders and divergence rules for derived resources
//! - `ngc`: NGC API client (key validation, NIM catalog)
//! - `predicate`: Label filter for credential Secret events
//! - `readiness`: KServe readiness gate
//! - `reconciler`: Account, App, Runtime and Secret-Trigger reconcilers
//! - `server`: HTTP servers for metrics and probes
//! - `store`: Object store seam over the Kubernetes API
//! - `sync`: Dependent resource synchronizer

pub mod admission;
pub mod backoff;
pub mod conditions;
pub mod dependents;
pub mod ngc;
pub mod predicate;
pub mod readiness;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod sync;
