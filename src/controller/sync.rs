//! # Dependent Resource Synchronizer
//!
//! Idempotent create, refresh and delete of resources owned by an Account,
//! App or Runtime.
//!
//! Every dependent is created with a controller owner reference so the
//! garbage collector cascades deletion from the owner. An existing object that
//! is controlled by someone else is never adopted or overwritten; it surfaces
//! as [`SyncError::ForeignOwner`], and deleting it is skipped. Divergent
//! specs are reported through [`Ensured::diverged`] and left alone.

use crate::controller::store::{ObjectStore, StoreError, StoreObject};
use crate::crd::ResourceRef;
use crate::observability::metrics;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} {namespace}/{name} is controlled by {owner}, not by this resource")]
    ForeignOwner {
        kind: String,
        namespace: String,
        name: String,
        owner: String,
    },
    #[error("owner {0} has no uid or namespace yet")]
    IncompleteOwner(String),
    #[error("conflicting write to {kind} {namespace}/{name}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. }) || matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// A resource kind the synchronizer can manage
pub trait DependentResource: StoreObject {
    /// Whether the stored object `self` differs from `desired` in the fields
    /// the operator manages. Server-populated defaults must not count.
    fn diverges_from(&self, desired: &Self) -> bool;
}

/// Result of [`ensure_exists`]
#[derive(Debug, Clone)]
pub struct Ensured<K> {
    /// The stored object
    pub object: K,
    pub reference: ResourceRef,
    /// Whether this call created the object
    pub created: bool,
    /// Whether a pre-existing object differs from the desired one
    pub diverged: bool,
}

fn owner_reference<O>(owner: &O) -> Result<(OwnerReference, String), SyncError>
where
    O: Resource<DynamicType = ()>,
{
    let describe = || {
        format!(
            "{} {}",
            O::kind(&()),
            owner.meta().name.as_deref().unwrap_or("<unnamed>")
        )
    };
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| SyncError::IncompleteOwner(describe()))?;
    let namespace = owner
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| SyncError::IncompleteOwner(describe()))?;
    Ok((owner_ref, namespace))
}

fn check_owner<K: StoreObject>(existing: &K, owner_ref: &OwnerReference) -> Result<(), SyncError> {
    let controller = existing
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true));
    match controller {
        Some(r) if r.uid == owner_ref.uid => Ok(()),
        other => Err(SyncError::ForeignOwner {
            kind: K::kind(&()).into_owned(),
            namespace: existing.meta().namespace.clone().unwrap_or_default(),
            name: existing.meta().name.clone().unwrap_or_default(),
            owner: other.map_or_else(
                || "nobody".to_string(),
                |r| format!("{} {}", r.kind, r.name),
            ),
        }),
    }
}

/// Make sure `desired` exists in the owner's namespace, owned by `owner`.
///
/// A create that loses a race against a concurrent writer re-reads the object
/// and treats it as pre-existing.
///
/// # Errors
///
/// [`SyncError::ForeignOwner`] when the object exists under another
/// controller, [`SyncError::IncompleteOwner`] when the owner has not been
/// persisted yet, and store errors otherwise.
pub async fn ensure_exists<S, O, K>(store: &S, owner: &O, mut desired: K) -> Result<Ensured<K>, SyncError>
where
    S: ObjectStore,
    O: Resource<DynamicType = ()>,
    K: DependentResource,
{
    let (owner_ref, namespace) = owner_reference(owner)?;
    let name = desired.meta().name.clone().unwrap_or_default();
    let kind = K::kind(&()).into_owned();

    desired.meta_mut().namespace = Some(namespace.clone());
    desired.meta_mut().owner_references = Some(vec![owner_ref.clone()]);

    let existing = match store.get::<K>(&namespace, &name).await? {
        Some(existing) => existing,
        None => match store.create(&namespace, &desired).await {
            Ok(created) => {
                info!(kind = %kind, resource.namespace = %namespace, resource.name = %name, "Created dependent resource");
                metrics::increment_dependents_created(&kind);
                return Ok(Ensured {
                    reference: ResourceRef::to_object(&created),
                    object: created,
                    created: true,
                    diverged: false,
                });
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(kind = %kind, resource.name = %name, "Lost create race, re-reading");
                store
                    .get::<K>(&namespace, &name)
                    .await?
                    .ok_or(SyncError::Conflict {
                        kind: kind.clone(),
                        namespace: namespace.clone(),
                        name: name.clone(),
                    })?
            }
            Err(e) => return Err(e.into()),
        },
    };

    check_owner(&existing, &owner_ref)?;
    let diverged = existing.diverges_from(&desired);
    if diverged {
        debug!(kind = %kind, resource.namespace = %namespace, resource.name = %name, "Dependent resource diverges from desired state");
    }
    Ok(Ensured {
        reference: ResourceRef::to_object(&existing),
        object: existing,
        created: false,
        diverged,
    })
}

/// Result of [`delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The object was owned by the owner and is now deleted
    Deleted,
    /// Nothing by that name exists
    Absent,
    /// The object is controlled by someone else and was left in place
    NotOwned,
}

/// Delete the dependent named by `reference` if `owner` controls it,
/// resolving an absent namespace against the owner's. Already-gone objects
/// count as deleted. An object without `owner`'s controller reference is
/// never deleted; it is logged and reported as [`Deletion::NotOwned`].
///
/// # Errors
///
/// [`SyncError::IncompleteOwner`] when the owner has no uid, store errors
/// other than not-found.
pub async fn delete<S, O, K>(store: &S, owner: &O, reference: &ResourceRef) -> Result<Deletion, SyncError>
where
    S: ObjectStore,
    O: Resource<DynamicType = ()>,
    K: DependentResource,
{
    let (owner_ref, owner_namespace) = owner_reference(owner)?;
    let namespace = reference.namespace_or(&owner_namespace);
    let kind = K::kind(&());

    let Some(existing) = store.get::<K>(namespace, &reference.name).await? else {
        return Ok(Deletion::Absent);
    };
    if let Err(e) = check_owner(&existing, &owner_ref) {
        warn!(error = %e, "Leaving dependent resource in place");
        return Ok(Deletion::NotOwned);
    }

    match store.delete::<K>(namespace, &reference.name).await {
        Ok(()) => {
            info!(kind = %kind, resource.namespace = %namespace, resource.name = %reference.name, "Deleted dependent resource");
            metrics::increment_dependents_deleted(&kind);
            Ok(Deletion::Deleted)
        }
        Err(StoreError::NotFound { .. }) => Ok(Deletion::Absent),
        Err(e) => Err(e.into()),
    }
}

/// Overwrite the dependent named by `reference` with `desired`, keeping its
/// identity and ownership.
///
/// # Errors
///
/// [`SyncError::Conflict`] when the object changed since it was read, so the
/// caller can re-queue rather than loop; [`SyncError::ForeignOwner`] when the
/// object is controlled by someone else; store errors otherwise, including
/// not-found.
pub async fn refresh<S, O, K>(store: &S, owner: &O, reference: &ResourceRef, mut desired: K) -> Result<K, SyncError>
where
    S: ObjectStore,
    O: Resource<DynamicType = ()>,
    K: DependentResource,
{
    let (owner_ref, owner_namespace) = owner_reference(owner)?;
    let namespace = reference.namespace_or(&owner_namespace).to_string();
    let kind = K::kind(&()).into_owned();

    let existing = store
        .get::<K>(&namespace, &reference.name)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            kind: kind.clone(),
            namespace: namespace.clone(),
            name: reference.name.clone(),
        })?;
    check_owner(&existing, &owner_ref)?;
    if !existing.diverges_from(&desired) {
        return Ok(existing);
    }

    let meta = desired.meta_mut();
    meta.name = Some(reference.name.clone());
    meta.namespace = Some(namespace.clone());
    meta.owner_references = existing.meta().owner_references.clone();
    meta.resource_version = existing.meta().resource_version.clone();
    meta.uid = existing.meta().uid.clone();

    match store.replace(&desired).await {
        Ok(updated) => {
            info!(kind = %kind, resource.namespace = %namespace, resource.name = %reference.name, "Refreshed dependent resource");
            Ok(updated)
        }
        Err(StoreError::Conflict { .. }) => Err(SyncError::Conflict {
            kind,
            namespace,
            name: reference.name.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}
