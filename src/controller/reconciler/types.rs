//! # Reconciler Types
//!
//! Outcome and error types of a single convergence pass.

use crate::controller::identity::IdentityError;
use crate::model::{ResourceKey, SubResourceKind};
use crate::provider::ProviderError;
use crate::store::StoreError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// What a finished pass asks of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Desired state reached; the next pass comes from resync or a change
    Converged,
    /// Still converging on an external condition; retry after a fixed delay
    Waiting(Duration),
    /// Not run because of the coalescing cooldown; retry after the remainder
    Skipped(Duration),
    /// The resource is gone from the system of record; forget the identity
    Removed,
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Spec can never converge as written
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("identity resolution failed: {0}")]
    Identity(#[from] IdentityError),

    /// An ensure step failed; later steps were not run
    #[error("{step} step failed for {resource}: {source}")]
    Step {
        step: SubResourceKind,
        resource: String,
        #[source]
        source: ProviderError,
    },

    /// A teardown step failed; the finalizer stays in place
    #[error("teardown of {step} {resource} failed: {source}")]
    Teardown {
        step: SubResourceKind,
        resource: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to persist {key}: {source}")]
    Store {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },
}

impl ReconcilerError {
    pub fn step(step: SubResourceKind, resource: impl Into<String>, source: ProviderError) -> Self {
        ReconcilerError::Step {
            step,
            resource: resource.into(),
            source,
        }
    }

    pub fn teardown(
        step: SubResourceKind,
        resource: impl Into<String>,
        source: ProviderError,
    ) -> Self {
        ReconcilerError::Teardown {
            step,
            resource: resource.into(),
            source,
        }
    }

    pub fn store(key: &ResourceKey, source: StoreError) -> Self {
        ReconcilerError::Store {
            key: key.clone(),
            source,
        }
    }

    /// Retrying without a spec change cannot help
    ///
    /// Teardown is always retried so a cluster is never stuck with its finalizer.
    pub fn is_terminal(&self) -> bool {
        match self {
            ReconcilerError::InvalidSpec(_) => true,
            ReconcilerError::Identity(e) => !e.is_retryable(),
            ReconcilerError::Step { source, .. } => source.is_terminal(),
            ReconcilerError::Teardown { .. } => false,
            ReconcilerError::Store { source, .. } => matches!(source, StoreError::Rejected(_)),
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcilerError::InvalidSpec(_) => "invalid_spec",
            ReconcilerError::Identity(_) => "identity",
            ReconcilerError::Step { .. } => "step",
            ReconcilerError::Teardown { .. } => "teardown",
            ReconcilerError::Store { .. } => "store",
        }
    }
}

/// One convergence pass for one identity
///
/// Callers guarantee a handler is never invoked twice concurrently for the same key.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError>;

    /// Current spec generation, consulted by the coalescing cache
    async fn generation(&self, _key: &ResourceKey) -> Option<i64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(ReconcilerError::InvalidSpec("bad".into()).is_terminal());
        assert!(ReconcilerError::step(
            SubResourceKind::LoadBalancer,
            "lb",
            ProviderError::Invalid("scheme".into())
        )
        .is_terminal());
        assert!(!ReconcilerError::step(
            SubResourceKind::Network,
            "vpc",
            ProviderError::Throttled("slow".into())
        )
        .is_terminal());
        assert!(!ReconcilerError::teardown(
            SubResourceKind::LoadBalancer,
            "lb",
            ProviderError::Invalid("odd".into())
        )
        .is_terminal());
    }

    #[test]
    fn test_step_error_names_step_and_resource() {
        let err = ReconcilerError::step(
            SubResourceKind::SecurityGroup,
            "default-prod-node",
            ProviderError::Transient("503".into()),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("security-group"));
        assert!(rendered.contains("default-prod-node"));
    }
}
