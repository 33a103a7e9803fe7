//! # Deletion Sequencer
//!
//! Reverse-order teardown gated by the cluster finalizer:
//! instance registration, load balancer, bastion, security groups, network.
//!
//! Every step deletes by deterministic name and by ownership tag and treats "not found"
//! as success. A failed step ends the pass with the finalizer still in place; the next
//! pass starts again from the top and the completed steps are no-ops. The finalizer is
//! removed only after every owned object describes as absent.

use super::ensure;
use super::status;
use super::types::{ReconcileAction, ReconcilerError};
use super::Reconciler;
use crate::constants::CLUSTER_FINALIZER;
use crate::controller::conditions::{reasons, ConditionType, Severity};
use crate::controller::events::{self, ClusterEvent};
use crate::crd::tags::cluster_tag_key;
use crate::model::security_group::SecurityGroupRole;
use crate::model::{
    bastion, load_balancer, naming, ManagedResource, SubResource, SubResourceKind,
};
use crate::observability;
use crate::provider::{CloudServices, ProviderError, ResourceService};
use std::fmt;
use tracing::{info, info_span, warn, Instrument};

/// Where a cluster is in its deletion lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPhase {
    NotDeleting,
    DeletionRequested,
    TearingDown,
    TornDown,
    Removed,
}

impl DeletionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionPhase::NotDeleting => "NotDeleting",
            DeletionPhase::DeletionRequested => "DeletionRequested",
            DeletionPhase::TearingDown => "TearingDown",
            DeletionPhase::TornDown => "TornDown",
            DeletionPhase::Removed => "Removed",
        }
    }

    /// Phase as seen from the stored object
    pub fn of(cluster: Option<&ManagedResource>) -> Self {
        match cluster {
            None => DeletionPhase::Removed,
            Some(c) if !c.is_deleting() => DeletionPhase::NotDeleting,
            Some(c) if c.status.conditions.get(ConditionType::Ready).is_some_and(|r| {
                r.reason.as_deref() == Some(reasons::DELETION_FAILED)
                    || r.reason.as_deref() == Some(reasons::DELETING)
            }) =>
            {
                DeletionPhase::TearingDown
            }
            Some(_) => DeletionPhase::DeletionRequested,
        }
    }
}

impl fmt::Display for DeletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn reconcile_delete(
    ctx: &Reconciler,
    cluster: &mut ManagedResource,
) -> Result<ReconcileAction, ReconcilerError> {
    if !cluster.has_finalizer() {
        info!("Deleting resource carries no finalizer, nothing to tear down");
        return Ok(ReconcileAction::Removed);
    }

    let span = info_span!("controller.delete", phase = tracing::field::Empty);
    async {
        observability::metrics::increment_teardowns();
        tracing::Span::current().record("phase", DeletionPhase::TearingDown.as_str());
        cluster.status.ready = false;
        cluster.status.conditions.mark_false(
            ConditionType::Ready,
            Severity::Info,
            reasons::DELETING,
            "tearing down cluster infrastructure",
        );

        let services = ctx.cloud_services(cluster).await?;

        if let Err(e) = teardown_all(ctx, cluster, &services).await {
            warn!(error = %e, "Teardown incomplete, keeping finalizer");
            cluster.status.conditions.mark_false(
                ConditionType::Ready,
                Severity::Warning,
                reasons::DELETION_FAILED,
                e.to_string(),
            );
            ctx.events
                .publish(ClusterEvent::warning(
                    &cluster.key,
                    events::reasons::DELETE_FAILED,
                    e.to_string(),
                ))
                .await;
            return Err(e);
        }

        tracing::Span::current().record("phase", DeletionPhase::TornDown.as_str());
        status::remove_finalizer(ctx.store.as_ref(), cluster, CLUSTER_FINALIZER).await?;
        info!("Teardown complete, finalizer removed");
        Ok(ReconcileAction::Removed)
    }
    .instrument(span)
    .await
}

async fn teardown_all(
    ctx: &Reconciler,
    cluster: &mut ManagedResource,
    services: &CloudServices,
) -> Result<(), ReconcilerError> {
    let infra = cluster.key.infra_name();
    let owner = cluster_tag_key(&infra);
    let lb_name = load_balancer::name(cluster);

    // Instance registration lives on the load balancer; an absent one means done
    match ensure::delete_if_present(services.attachments.as_ref(), &lb_name).await {
        Ok(_) => cluster.status.network.registered_instances.clear(),
        Err(e) => {
            return Err(ReconcilerError::teardown(
                SubResourceKind::InstanceAttachment,
                lb_name,
                e,
            ))
        }
    }

    teardown_kind(ctx, cluster, services.load_balancers.as_ref(), &owner, &[lb_name.clone()])
        .await?;
    cluster.status.network.api_server_elb = None;
    cluster.status.control_plane_endpoint = None;

    teardown_kind(
        ctx,
        cluster,
        services.bastions.as_ref(),
        &owner,
        &[bastion::name(cluster)],
    )
    .await?;
    cluster.status.bastion = None;

    let group_names = security_group_names(&infra);
    teardown_kind(ctx, cluster, services.security_groups.as_ref(), &owner, &group_names).await?;
    cluster.status.network.security_groups.clear();

    let managed_vpc = !cluster.spec.is_unmanaged_vpc();
    let vpc_names = if managed_vpc {
        vec![naming::vpc_name(&infra)]
    } else {
        Vec::new()
    };
    if managed_vpc {
        teardown_kind(ctx, cluster, services.networks.as_ref(), &owner, &vpc_names).await?;
        cluster.status.network.vpc = None;
    } else {
        info!("VPC is unmanaged, leaving it in place");
    }

    // Nothing owned may remain before the finalizer goes
    confirm_absent(services.load_balancers.as_ref(), &owner, &[lb_name]).await?;
    confirm_absent(
        services.bastions.as_ref(),
        &owner,
        &[bastion::name(cluster)],
    )
    .await?;
    confirm_absent(services.security_groups.as_ref(), &owner, &group_names).await?;
    confirm_absent(services.networks.as_ref(), &owner, &vpc_names).await?;
    Ok(())
}

async fn teardown_kind<R: SubResource>(
    ctx: &Reconciler,
    cluster: &ManagedResource,
    service: &dyn ResourceService<R>,
    owner: &str,
    known: &[String],
) -> Result<(), ReconcilerError> {
    let deleted = ensure::teardown(service, owner, known)
        .await
        .map_err(|(name, e)| ReconcilerError::teardown(R::KIND, name, e))?;
    for name in deleted {
        info!(step = R::KIND.as_str(), name = %name, "Deleted");
        ctx.events
            .publish(ClusterEvent::normal(
                &cluster.key,
                events::reasons::DELETED,
                format!("Deleted {} {name}", R::KIND),
            ))
            .await;
    }
    Ok(())
}

async fn confirm_absent<R: SubResource>(
    service: &dyn ResourceService<R>,
    owner: &str,
    known: &[String],
) -> Result<(), ReconcilerError> {
    let present = ensure::still_present(service, owner, known)
        .await
        .map_err(|e| ReconcilerError::teardown(R::KIND, owner, e))?;
    match present.first() {
        None => Ok(()),
        Some(name) => Err(ReconcilerError::teardown(
            R::KIND,
            name.clone(),
            ProviderError::Conflict(format!("{} {name} still present after delete", R::KIND)),
        )),
    }
}

fn security_group_names(infra: &str) -> Vec<String> {
    SecurityGroupRole::ALL
        .iter()
        .map(|role| naming::security_group_name(infra, *role))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AwsClusterSpec;
    use crate::model::ResourceKey;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn cluster() -> ManagedResource {
        ManagedResource {
            key: ResourceKey::new("default", "prod"),
            generation: 1,
            resource_version: "1".to_string(),
            annotations: BTreeMap::new(),
            finalizers: vec![CLUSTER_FINALIZER.to_string()],
            deletion_timestamp: None,
            spec: AwsClusterSpec::default(),
            status: Default::default(),
        }
    }

    #[test]
    fn test_phase_of_stored_object() {
        assert_eq!(DeletionPhase::of(None), DeletionPhase::Removed);

        let mut c = cluster();
        assert_eq!(DeletionPhase::of(Some(&c)), DeletionPhase::NotDeleting);

        c.deletion_timestamp = Some(Utc::now());
        assert_eq!(DeletionPhase::of(Some(&c)), DeletionPhase::DeletionRequested);

        c.status.conditions.mark_false(
            ConditionType::Ready,
            Severity::Warning,
            reasons::DELETION_FAILED,
            "load balancer delete throttled",
        );
        assert_eq!(DeletionPhase::of(Some(&c)), DeletionPhase::TearingDown);
    }

    #[test]
    fn test_every_security_group_role_is_torn_down() {
        let names = security_group_names("default-prod");
        assert_eq!(names.len(), SecurityGroupRole::ALL.len());
        assert!(names.contains(&"default-prod-apiserver-lb".to_string()));
    }
}
