//! # Finalizer
//!
//! Adding and removing the operator's cleanup finalizer. Both are plain
//! metadata writes guarded by `resourceVersion`.

use crate::constants::FINALIZER;
use crate::controller::store::{ObjectStore, StoreError, StoreObject};
use tracing::debug;

#[must_use]
pub fn has_finalizer<K: StoreObject>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Record the finalizer on `obj`; returns the stored object.
///
/// # Errors
///
/// Store errors, including `Conflict` when `obj` is stale.
pub async fn add_finalizer<S: ObjectStore, K: StoreObject>(store: &S, obj: &K) -> Result<K, StoreError> {
    if has_finalizer(obj) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    debug!(resource.name = ?obj.meta().name, "Adding finalizer");
    store.replace(&updated).await
}

/// Drop the finalizer from `obj`, letting deletion complete.
///
/// # Errors
///
/// Store errors other than not-found; an object that is already gone is fine.
pub async fn remove_finalizer<S: ObjectStore, K: StoreObject>(store: &S, obj: &K) -> Result<(), StoreError> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
    debug!(resource.name = ?obj.meta().name, "Removing finalizer");
    match store.replace(&updated).await {
        Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
