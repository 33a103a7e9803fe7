//! # Kubernetes Store
//!
//! [`ResourceStore`] backed by the `AWSCluster` custom resource.
//!
//! Patches are JSON merge patches that carry `metadata.resourceVersion`, so the API
//! server rejects a write made against a stale object with 409. A merge patch only
//! removes a key that it sets to null, so status patches are computed against the
//! stored status.

use super::{ResourceStore, StoreError};
use crate::crd::{AWSCluster, AwsClusterStatus};
use crate::model::{ManagedResource, ResourceKey};
use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{Map, Value};
use tracing::debug;

/// Store talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// `None` watches every namespace
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, namespace: &str) -> Api<AWSCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn store_error(key: &ResourceKey, resource_version: &str, e: kube::Error) -> StoreError {
        match e {
            kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound(key.clone()),
            kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict {
                key: key.clone(),
                expected: resource_version.to_string(),
            },
            other => StoreError::Kube(other.to_string()),
        }
    }

    fn new_version(obj: &AWSCluster) -> String {
        obj.metadata.resource_version.clone().unwrap_or_default()
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, StoreError> {
        let obj = self
            .api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::Kube(e.to_string()))?;
        Ok(obj.as_ref().and_then(ManagedResource::from_kube))
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        status: &AwsClusterStatus,
        resource_version: &str,
    ) -> Result<String, StoreError> {
        let api = self.api(&key.namespace);
        let stored = api
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::Kube(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let current = serde_json::to_value(&stored.status)
            .map_err(|e| StoreError::Kube(e.to_string()))?;
        let desired =
            serde_json::to_value(status).map_err(|e| StoreError::Kube(e.to_string()))?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": merge_patch(&current, &desired),
        });
        let obj = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Self::store_error(key, resource_version, e))?;
        debug!(resource = %key, "Patched status");
        Ok(Self::new_version(&obj))
    }

    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<String, StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        let obj = self
            .api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Self::store_error(key, resource_version, e))?;
        debug!(resource = %key, finalizers = ?finalizers, "Patched finalizers");
        Ok(Self::new_version(&obj))
    }

    async fn list(&self) -> Result<Vec<ResourceKey>, StoreError> {
        let api: Api<AWSCluster> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Kube(e.to_string()))?;
        Ok(list
            .items
            .iter()
            .filter_map(|obj| {
                Some(ResourceKey::new(
                    obj.metadata.namespace.clone()?,
                    obj.metadata.name.clone()?,
                ))
            })
            .collect())
    }
}

/// Merge patch turning `current` into `desired`
///
/// Keys present only in `current` are set to null. Non-object values replace whole.
fn merge_patch(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            let mut patch = Map::new();
            for key in current.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in desired {
                let entry = match current.get(key) {
                    Some(old) => merge_patch(old, value),
                    None => value.clone(),
                };
                patch.insert(key.clone(), entry);
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}
