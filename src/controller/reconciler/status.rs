//! # Status Management
//!
//! Persists the status computed by a pass.

use super::types::ReconcilerError;
use crate::crd::AwsClusterStatus;
use crate::model::ManagedResource;
use crate::store::ResourceStore;
use tracing::debug;

/// Patch the status when it differs from `original`
///
/// Skipping unchanged writes keeps a converged cluster from generating watch events on
/// every resync. The new resource version is stored on `cluster`.
pub async fn persist_status(
    store: &dyn ResourceStore,
    cluster: &mut ManagedResource,
    original: &AwsClusterStatus,
) -> Result<bool, ReconcilerError> {
    if &cluster.status == original {
        debug!(resource = %cluster.key, "Skipping status update - status unchanged");
        return Ok(false);
    }
    let version = store
        .patch_status(&cluster.key, &cluster.status, &cluster.resource_version)
        .await
        .map_err(|e| ReconcilerError::store(&cluster.key, e))?;
    cluster.resource_version = version;
    Ok(true)
}

/// Add `finalizer` unless present and persist it
pub async fn add_finalizer(
    store: &dyn ResourceStore,
    cluster: &mut ManagedResource,
    finalizer: &str,
) -> Result<bool, ReconcilerError> {
    if cluster.finalizers.iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers = cluster.finalizers.clone();
    finalizers.push(finalizer.to_string());
    let version = store
        .patch_finalizers(&cluster.key, &finalizers, &cluster.resource_version)
        .await
        .map_err(|e| ReconcilerError::store(&cluster.key, e))?;
    cluster.finalizers = finalizers;
    cluster.resource_version = version;
    Ok(true)
}

/// Remove `finalizer` and persist; a deleting resource may disappear as a result
pub async fn remove_finalizer(
    store: &dyn ResourceStore,
    cluster: &mut ManagedResource,
    finalizer: &str,
) -> Result<(), ReconcilerError> {
    let finalizers: Vec<String> = cluster
        .finalizers
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    let version = store
        .patch_finalizers(&cluster.key, &finalizers, &cluster.resource_version)
        .await
        .map_err(|e| ReconcilerError::store(&cluster.key, e))?;
    cluster.finalizers = finalizers;
    cluster.resource_version = version;
    Ok(())
}
