//! # In-Memory Store
//!
//! A versioned map standing in for the Kubernetes API server.
//!
//! Spec writes go through admission (defaulting plus create/update validation), every
//! write bumps the resource version, and deletion only removes the object once its
//! finalizers are gone.

use super::{ResourceStore, StoreError};
use crate::controller::reconciler::validation;
use crate::crd::{AwsClusterSpec, AwsClusterStatus};
use crate::model::{ManagedResource, ResourceKey};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<ResourceKey, ManagedResource>,
    version: u64,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_version(
        &self,
        key: &ResourceKey,
        resource_version: &str,
    ) -> Result<(), StoreError> {
        let current = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.resource_version != resource_version {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: resource_version.to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory store; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update the spec of a cluster
    ///
    /// Defaults are applied first, then the create or update validation runs. The
    /// generation increases only when the spec actually changes.
    pub fn apply(
        &self,
        key: &ResourceKey,
        spec: AwsClusterSpec,
        annotations: BTreeMap<String, String>,
    ) -> Result<ManagedResource, StoreError> {
        let spec = validation::apply_defaults(spec);
        let mut state = self.state();
        let version = state.next_version();
        let resource = match state.objects.get(key) {
            Some(existing) => {
                validation::validate_update(&existing.spec, &spec)?;
                let mut updated = existing.clone();
                if updated.spec != spec {
                    updated.generation += 1;
                    updated.spec = spec;
                }
                updated.annotations = annotations;
                updated.resource_version = version;
                updated
            }
            None => {
                validation::validate_create(&spec)?;
                ManagedResource {
                    key: key.clone(),
                    generation: 1,
                    resource_version: version,
                    annotations,
                    finalizers: Vec::new(),
                    deletion_timestamp: None,
                    spec,
                    status: AwsClusterStatus::default(),
                }
            }
        };
        debug!(resource = %key, generation = resource.generation, "Applied spec");
        state.objects.insert(key.clone(), resource.clone());
        Ok(resource)
    }

    /// Mark a cluster for deletion; it is removed at once when it has no finalizers
    pub fn request_deletion(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let mut state = self.state();
        let version = state.next_version();
        let resource = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if resource.deletion_timestamp.is_none() {
            resource.deletion_timestamp = Some(Utc::now());
            resource.resource_version = version;
        }
        if resource.finalizers.is_empty() {
            state.objects.remove(key);
        }
        Ok(())
    }

    pub fn snapshot(&self, key: &ResourceKey) -> Option<ManagedResource> {
        self.state().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state().objects.contains_key(key)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        status: &AwsClusterStatus,
        resource_version: &str,
    ) -> Result<String, StoreError> {
        let mut state = self.state();
        state.check_version(key, resource_version)?;
        let version = state.next_version();
        if let Some(resource) = state.objects.get_mut(key) {
            resource.status = status.clone();
            resource.resource_version = version.clone();
        }
        Ok(version)
    }

    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<String, StoreError> {
        let mut state = self.state();
        state.check_version(key, resource_version)?;
        let version = state.next_version();
        let mut remove = false;
        if let Some(resource) = state.objects.get_mut(key) {
            resource.finalizers = finalizers.to_vec();
            resource.resource_version = version.clone();
            remove = resource.is_deleting() && resource.finalizers.is_empty();
        }
        if remove {
            debug!(resource = %key, "Finalizers cleared, removing resource");
            state.objects.remove(key);
        }
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<ResourceKey>, StoreError> {
        Ok(self.state().objects.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLUSTER_FINALIZER;

    fn spec() -> AwsClusterSpec {
        AwsClusterSpec {
            region: "us-west-2".to_string(),
            ..AwsClusterSpec::default()
        }
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "prod");
        let created = store.apply(&key, spec(), BTreeMap::new()).unwrap();

        let v2 = store
            .patch_status(&key, &AwsClusterStatus::default(), &created.resource_version)
            .await
            .unwrap();
        let err = store
            .patch_status(&key, &AwsClusterStatus::default(), &created.resource_version)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store
            .patch_status(&key, &AwsClusterStatus::default(), &v2)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_generation_only_moves_on_spec_change() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "prod");
        store.apply(&key, spec(), BTreeMap::new()).unwrap();
        let same = store.apply(&key, spec(), BTreeMap::new()).unwrap();
        assert_eq!(same.generation, 1);

        let mut changed = spec();
        changed.additional_tags.insert("team", "infra");
        let updated = store.apply(&key, changed, BTreeMap::new()).unwrap();
        assert_eq!(updated.generation, 2);
    }

    #[tokio::test]
    async fn test_apply_runs_admission() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "prod");
        store.apply(&key, spec(), BTreeMap::new()).unwrap();

        let mut moved = spec();
        moved.region = "eu-west-1".to_string();
        let err = store.apply(&key, moved, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let applied = store.snapshot(&key).unwrap();
        assert_eq!(applied.spec.network.vpc.cidr_block, "10.0.0.0/16");
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "prod");
        let created = store.apply(&key, spec(), BTreeMap::new()).unwrap();
        let version = store
            .patch_finalizers(&key, &[CLUSTER_FINALIZER.to_string()], &created.resource_version)
            .await
            .unwrap();
        assert_ne!(version, created.resource_version);

        store.request_deletion(&key).unwrap();
        let deleting = store.snapshot(&key).unwrap();
        assert!(deleting.is_deleting());

        store
            .patch_finalizers(&key, &[], &deleting.resource_version)
            .await
            .unwrap();
        assert!(!store.contains(&key));
    }

    #[tokio::test]
    async fn test_deletion_without_finalizer_removes_immediately() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "prod");
        store.apply(&key, spec(), BTreeMap::new()).unwrap();
        store.request_deletion(&key).unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
