//! # Reconciler
//!
//! The convergence engine: one pass loads a cluster, resolves its identity and then
//! either drives the sub-resources toward the spec ([`normal`]) or tears them down in
//! reverse order ([`delete`]).
//!
//! A pass is a sequential call chain. Callers guarantee it never runs twice at once for
//! the same identity; the scheduler enforces that.

pub mod delete;
pub mod ensure;
pub mod normal;
pub mod status;
pub mod types;
pub mod validation;

pub use types::{ReconcileAction, ReconcileHandler, ReconcilerError};

use crate::config::ControllerConfig;
use crate::controller::conditions::{reasons, ConditionType, Severity};
use crate::controller::events::{self, ClusterEvent, EventSink};
use crate::controller::identity::CredentialResolver;
use crate::crd::IdentityReference;
use crate::model::{ManagedResource, ResourceKey, SubResourceKind};
use crate::observability;
use crate::provider::{CloudServices, DnsResolver, ProviderError, ServiceFactory};
use crate::store::ResourceStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Collaborators shared by every pass
pub struct Reconciler {
    pub store: Arc<dyn ResourceStore>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub services: Arc<dyn ServiceFactory>,
    pub dns: Arc<dyn DnsResolver>,
    pub events: Arc<dyn EventSink>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        credentials: Arc<dyn CredentialResolver>,
        services: Arc<dyn ServiceFactory>,
        dns: Arc<dyn DnsResolver>,
        events: Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            services,
            dns,
            events,
            config,
        }
    }

    async fn run_pass(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError> {
        let Some(mut cluster) = self
            .store
            .get(key)
            .await
            .map_err(|e| ReconcilerError::store(key, e))?
        else {
            debug!("Resource no longer exists");
            return Ok(ReconcileAction::Removed);
        };

        if cluster.is_paused() {
            info!("Resource is paused, skipping reconciliation");
            return Ok(ReconcileAction::Converged);
        }

        let original = cluster.status.clone();
        let result = if cluster.is_deleting() {
            delete::reconcile_delete(self, &mut cluster).await
        } else {
            normal::reconcile_normal(self, &mut cluster).await
        };

        if matches!(result, Ok(ReconcileAction::Removed)) {
            return result;
        }
        match status::persist_status(self.store.as_ref(), &mut cluster, &original).await {
            Ok(_) => result,
            // The pass error is the more useful one to surface
            Err(persist_err) => match result {
                Ok(_) => Err(persist_err),
                Err(pass_err) => {
                    warn!(error = %persist_err, "Failed to persist status after failed pass");
                    Err(pass_err)
                }
            },
        }
    }

    /// Resolve the cluster's identity and build the service layer for it
    ///
    /// Failure stops the pass before any step runs and is reported on the principal
    /// conditions.
    pub(crate) async fn cloud_services(
        &self,
        cluster: &mut ManagedResource,
    ) -> Result<CloudServices, ReconcilerError> {
        let reference = cluster
            .spec
            .identity_ref
            .clone()
            .unwrap_or_else(IdentityReference::controller_default);
        let conditions = &mut cluster.status.conditions;

        match self
            .credentials
            .resolve(&reference, &cluster.key.namespace)
            .await
        {
            Ok(credentials) => {
                conditions.mark_true(ConditionType::PrincipalUsageAllowed);
                conditions.mark_true(ConditionType::PrincipalCredentialRetrieved);
                Ok(self.services.services(&credentials, &cluster.spec.region))
            }
            Err(e) => {
                if e.is_usage_denied() {
                    conditions.mark_false(
                        ConditionType::PrincipalUsageAllowed,
                        Severity::Error,
                        reasons::NAMESPACE_NOT_PERMITTED,
                        e.to_string(),
                    );
                } else {
                    let severity = if e.is_retryable() {
                        Severity::Warning
                    } else {
                        Severity::Error
                    };
                    conditions.mark_false(
                        ConditionType::PrincipalCredentialRetrieved,
                        severity,
                        reasons::PRINCIPAL_CREDENTIAL_RETRIEVAL_FAILED,
                        e.to_string(),
                    );
                }
                self.events
                    .publish(ClusterEvent::warning(
                        &cluster.key,
                        events::reasons::IDENTITY_FAILED,
                        format!("Failed to resolve identity {reference}: {e}"),
                    ))
                    .await;
                Err(ReconcilerError::Identity(e))
            }
        }
    }

    /// Record a failed ensure step and build the error that ends the pass
    pub(crate) async fn step_failed(
        &self,
        cluster: &mut ManagedResource,
        step: SubResourceKind,
        resource: &str,
        error: ProviderError,
    ) -> ReconcilerError {
        let severity = if error.is_terminal() {
            Severity::Error
        } else {
            Severity::Warning
        };
        warn!(
            step = step.as_str(),
            resource,
            error = %error,
            "Ensure step failed, aborting remaining steps"
        );
        cluster.status.conditions.mark_false(
            step.condition(),
            severity,
            failure_reason(step),
            error.to_string(),
        );
        observability::metrics::increment_step_failures(step.as_str());
        self.events
            .publish(ClusterEvent::warning(
                &cluster.key,
                events::reasons::CREATE_FAILED,
                format!("Failed to reconcile {step} {resource}: {error}"),
            ))
            .await;
        ReconcilerError::step(step, resource, error)
    }
}

/// Condition reason reported when the step of `kind` fails
pub fn failure_reason(kind: SubResourceKind) -> &'static str {
    match kind {
        SubResourceKind::Network => reasons::NETWORK_FAILED,
        SubResourceKind::SecurityGroup => reasons::SECURITY_GROUPS_FAILED,
        SubResourceKind::Bastion => reasons::BASTION_FAILED,
        SubResourceKind::LoadBalancer => reasons::LOAD_BALANCER_FAILED,
        SubResourceKind::InstanceAttachment => reasons::INSTANCE_REGISTRATION_FAILED,
    }
}

#[async_trait]
impl ReconcileHandler for Reconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError> {
        let pass_id = Uuid::new_v4();
        let span = info_span!(
            "controller.reconcile",
            resource.namespace = %key.namespace,
            resource.name = %key.name,
            pass_id = %pass_id
        );
        async {
            observability::metrics::increment_reconciliations();
            let started = Instant::now();
            let result = self.run_pass(key).await;
            observability::metrics::observe_reconciliation_duration(
                started.elapsed().as_secs_f64(),
            );
            match &result {
                Ok(action) => debug!(?action, "Pass finished"),
                Err(e) => debug!(error = %e, "Pass failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn generation(&self, key: &ResourceKey) -> Option<i64> {
        self.store.get(key).await.ok().flatten().map(|c| c.generation)
    }
}
