//! # Reconciler
//!
//! Reconciliation logic for the operator's resources.
//!
//! - `account`: `OdhNIMAccount`, gated on KServe readiness
//! - `app`: `OdhNimApp`, credential validation and catalog content
//! - `runtime`: `OdhNIMRuntime`, staged provisioning of a NIM deployment
//! - `secret`: labeled credential Secrets, driving App lifecycle
//!
//! Every reconciler reads fresh state from the [`ObjectStore`], writes
//! through it with optimistic concurrency and reports an [`Outcome`]. A
//! conflicting write always becomes [`Outcome::Requeue`].
//!
//! [`ObjectStore`]: crate::controller::store::ObjectStore

pub mod account;
pub mod app;
pub mod finalizer;
pub mod runtime;
pub mod secret;
pub mod types;

pub use account::reconcile_account;
pub use app::reconcile_app;
pub use runtime::reconcile_runtime;
pub use secret::reconcile_secret;
pub use types::{Outcome, Reconciler, ReconcilerError};
