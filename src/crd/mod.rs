//! # Custom Resource Definitions
//!
//! CRD types for the NIM operator.
//!
//! ## Module Structure
//!
//! - `account.rs` - `OdhNIMAccount`, the cluster credential binding
//! - `app.rs` - `OdhNimApp`, the per-namespace validation and content driver
//! - `runtime.rs` - `OdhNIMRuntime`, a single NIM deployment
//! - `status.rs` - Conditions and object references shared by all three
//! - `external.rs` - Resources owned by other operators (ODH, KServe, OpenShift)

mod account;
mod app;
mod external;
mod runtime;
mod status;

use schemars::{json_schema, Schema, SchemaGenerator};

pub use account::{NimAccount, NimAccountSpec, NimAccountStatus};
pub use app::{ApiKeySpec, ContentSpec, NimApp, NimAppSpec, NimAppStatus};
pub use external::{
    DataScienceCluster, DataScienceClusterSpec, DataScienceClusterStatus, InferenceService,
    InferenceServiceSpec, ServingRuntime, ServingRuntimeSpec, Template, TemplateParameter,
};
pub use runtime::{NimRuntime, NimRuntimeSpec, NimRuntimeStatus, StorageClaimSpec, StorageResources};
pub use status::{Condition, ConditionStatus, ResourceRef};

/// Schema for free-form fields embedded from other APIs
///
/// The API server keeps unknown fields instead of pruning them; validation is
/// left to the owning operator.
pub(crate) fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
