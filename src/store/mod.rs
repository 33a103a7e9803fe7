//! # Store
//!
//! Persistence layer for managed clusters.
//!
//! Reads return the whole resource; writes are partial (status only, or finalizers only)
//! and carry the resource version the caller last saw. A write against a stale version
//! fails with [`StoreError::Conflict`] instead of clobbering a concurrent edit.

pub mod kube;
pub mod memory;

use crate::controller::reconciler::validation::ValidationErrors;
use crate::crd::AwsClusterStatus;
use crate::model::{ManagedResource, ResourceKey};
use async_trait::async_trait;
use thiserror::Error;

pub use self::kube::KubeStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ResourceKey),

    #[error("{key} was modified concurrently (expected version {expected})")]
    Conflict { key: ResourceKey, expected: String },

    #[error("spec rejected: {0}")]
    Rejected(#[from] ValidationErrors),

    #[error("kubernetes API error: {0}")]
    Kube(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Get/patch contract of the system of record
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, StoreError>;

    /// Replace the status; returns the new resource version
    async fn patch_status(
        &self,
        key: &ResourceKey,
        status: &AwsClusterStatus,
        resource_version: &str,
    ) -> Result<String, StoreError>;

    /// Replace the finalizer list; returns the new resource version
    ///
    /// A deleting resource whose finalizer list becomes empty is removed.
    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<String, StoreError>;

    async fn list(&self) -> Result<Vec<ResourceKey>, StoreError>;
}
