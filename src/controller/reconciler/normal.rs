//! # Normal Pass
//!
//! Ordered ensure steps for a live cluster:
//!
//! 1. Network (VPC and subnets)
//! 2. Security groups, created empty first so rules can reference each other by id
//! 3. Bastion host, or its removal when disabled
//! 4. API server load balancer
//! 5. Control plane instance registration
//!
//! A failed step marks its condition False and ends the pass; later steps never run
//! against a failed prerequisite. Once every step succeeded the load balancer's DNS
//! name gates the control plane endpoint: an empty or unresolvable name is a waiting
//! outcome, not an error.

use super::ensure::{self, Ensured};
use super::status;
use super::types::{ReconcileAction, ReconcilerError};
use super::validation;
use super::Reconciler;
use crate::constants::CLUSTER_FINALIZER;
use crate::controller::conditions::{reasons, ConditionType, Severity};
use crate::controller::events::{self, ClusterEvent};
use crate::crd::{
    ApiEndpoint, AwsClusterSpec, FailureDomain, SecurityGroupStatus, SubnetStatus, VpcStatus,
};
use crate::model::security_group::{self, SecurityGroupRole};
use crate::model::{
    attachment, bastion, load_balancer, network, ManagedResource, ResourceKey, SubResource,
    SubResourceKind,
};
use crate::provider::{CloudServices, ProviderError, ResourceService};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Conditions folded into `Ready`, in tie-break order
pub fn summary_types(spec: &AwsClusterSpec) -> Vec<ConditionType> {
    let mut types = vec![
        ConditionType::PrincipalCredentialRetrieved,
        ConditionType::PrincipalUsageAllowed,
        ConditionType::NetworkReady,
        ConditionType::SecurityGroupsReady,
    ];
    if spec.bastion.enabled {
        types.push(ConditionType::BastionReady);
    }
    types.push(ConditionType::LoadBalancerReady);
    types.push(ConditionType::InstancesRegistered);
    types
}

pub async fn reconcile_normal(
    ctx: &Reconciler,
    cluster: &mut ManagedResource,
) -> Result<ReconcileAction, ReconcilerError> {
    if let Err(errors) = validation::validate_create(&cluster.spec) {
        let message = errors.to_string();
        cluster.status.conditions.mark_false(
            ConditionType::Ready,
            Severity::Error,
            reasons::INVALID_SPEC,
            message.clone(),
        );
        cluster.status.ready = false;
        ctx.events
            .publish(ClusterEvent::warning(
                &cluster.key,
                events::reasons::INVALID_SPEC,
                message.clone(),
            ))
            .await;
        return Err(ReconcilerError::InvalidSpec(message));
    }

    if status::add_finalizer(ctx.store.as_ref(), cluster, CLUSTER_FINALIZER).await? {
        debug!(finalizer = CLUSTER_FINALIZER, "Added finalizer");
    }

    let result = converge(ctx, cluster).await;

    let summary = summary_types(&cluster.spec);
    cluster.status.conditions.set_summary(&summary);
    cluster.status.ready = cluster.status.conditions.is_true(ConditionType::Ready);
    cluster.status.observed_generation = Some(cluster.generation);
    result
}

async fn converge(
    ctx: &Reconciler,
    cluster: &mut ManagedResource,
) -> Result<ReconcileAction, ReconcilerError> {
    let services = ctx.cloud_services(cluster).await?;
    let key = cluster.key.clone();
    let port = ctx.config.api_server_port;
    let requeue = ctx.config.dns_requeue_interval;
    let mut waiting: Option<Duration> = None;

    // Network
    let desired_network = network::desired(cluster);
    let vpc = match ensure_recorded(ctx, &key, services.networks.as_ref(), &desired_network).await
    {
        Ok(vpc) => vpc,
        Err(e) => {
            return Err(ctx
                .step_failed(cluster, SubResourceKind::Network, &desired_network.name, e)
                .await)
        }
    };
    cluster.status.network.vpc = Some(vpc.clone());
    cluster.status.conditions.mark_true(ConditionType::NetworkReady);

    // Security groups
    let groups = match ensure_security_groups(ctx, &key, &services, cluster, &vpc.id, port).await
    {
        Ok(groups) => groups,
        Err((name, e)) => {
            return Err(ctx
                .step_failed(cluster, SubResourceKind::SecurityGroup, &name, e)
                .await)
        }
    };
    let group_id = |role: SecurityGroupRole| {
        groups
            .get(&role)
            .map(|g| g.id.clone())
            .unwrap_or_default()
    };
    cluster.status.network.security_groups = groups
        .iter()
        .map(|(role, g)| (role.as_str().to_string(), g.clone()))
        .collect();
    cluster
        .status
        .conditions
        .mark_true(ConditionType::SecurityGroupsReady);

    // Bastion
    if cluster.spec.bastion.enabled {
        let name = bastion::name(cluster);
        let Some(subnet) = bastion_subnet(&vpc) else {
            let err = ProviderError::Invalid("no subnet available for the bastion host".into());
            return Err(ctx
                .step_failed(cluster, SubResourceKind::Bastion, &name, err)
                .await);
        };
        let desired = bastion::desired(cluster, &subnet.id, &group_id(SecurityGroupRole::Bastion));
        let instance = match ensure_recorded(ctx, &key, services.bastions.as_ref(), &desired).await
        {
            Ok(instance) => instance,
            Err(e) => {
                return Err(ctx
                    .step_failed(cluster, SubResourceKind::Bastion, &name, e)
                    .await)
            }
        };
        if instance.state == bastion::STATE_RUNNING {
            cluster.status.conditions.mark_true(ConditionType::BastionReady);
        } else {
            cluster.status.conditions.mark_false(
                ConditionType::BastionReady,
                Severity::Info,
                reasons::INSTANCE_NOT_READY,
                format!(
                    "bastion instance {} is {}",
                    instance.instance_id, instance.state
                ),
            );
            waiting = Some(requeue);
        }
        cluster.status.bastion = Some(instance);
    } else {
        let name = bastion::name(cluster);
        match ensure::ensure_absent(services.bastions.as_ref(), &name).await {
            Ok(true) => {
                info!(bastion = %name, "Bastion disabled, deleted instance");
                ctx.events
                    .publish(ClusterEvent::normal(
                        &key,
                        events::reasons::DELETED,
                        format!("Deleted bastion {name}"),
                    ))
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                return Err(ctx
                    .step_failed(cluster, SubResourceKind::Bastion, &name, e)
                    .await)
            }
        }
        cluster.status.bastion = None;
        cluster.status.conditions.delete(ConditionType::BastionReady);
    }

    // Load balancer
    let desired_lb = load_balancer::desired(
        cluster,
        &vpc.subnets,
        &group_id(SecurityGroupRole::ApiServerLb),
        port,
    );
    let lb = match ensure_recorded(ctx, &key, services.load_balancers.as_ref(), &desired_lb).await
    {
        Ok(lb) => lb,
        Err(e) => {
            return Err(ctx
                .step_failed(cluster, SubResourceKind::LoadBalancer, &desired_lb.name, e)
                .await)
        }
    };
    cluster.status.network.api_server_elb = Some(lb.clone());

    // Instance registration
    let desired_attachment =
        attachment::desired(&lb.name, &cluster.spec.control_plane_instance_ids);
    let registered = match ensure_recorded(
        ctx,
        &key,
        services.attachments.as_ref(),
        &desired_attachment,
    )
    .await
    {
        Ok(registered) => registered,
        Err(e) => {
            return Err(ctx
                .step_failed(cluster, SubResourceKind::InstanceAttachment, &lb.name, e)
                .await)
        }
    };
    cluster.status.network.registered_instances = registered.instance_ids;
    cluster
        .status
        .conditions
        .mark_true(ConditionType::InstancesRegistered);

    // DNS gate
    if lb.dns_name.is_empty() {
        info!(load_balancer = %lb.name, "Waiting for load balancer DNS name");
        cluster.status.conditions.mark_false(
            ConditionType::LoadBalancerReady,
            Severity::Info,
            reasons::WAIT_FOR_DNS_NAME,
            format!("load balancer {} has no DNS name yet", lb.name),
        );
        return Ok(ReconcileAction::Waiting(requeue));
    }
    if !ctx.dns.resolves(&lb.dns_name).await {
        info!(dns_name = %lb.dns_name, "Waiting for load balancer DNS name to resolve");
        cluster.status.conditions.mark_false(
            ConditionType::LoadBalancerReady,
            Severity::Info,
            reasons::WAIT_FOR_DNS_NAME_RESOLVE,
            format!("DNS name {} does not resolve yet", lb.dns_name),
        );
        return Ok(ReconcileAction::Waiting(requeue));
    }
    cluster
        .status
        .conditions
        .mark_true(ConditionType::LoadBalancerReady);

    cluster.status.control_plane_endpoint = Some(ApiEndpoint {
        host: lb.dns_name.clone(),
        port,
    });
    cluster.status.failure_domains = failure_domains(&vpc.subnets, &lb.availability_zones);

    Ok(waiting.map_or(ReconcileAction::Converged, ReconcileAction::Waiting))
}

/// Ensure and publish an event when something was created or changed
async fn ensure_recorded<R: SubResource>(
    ctx: &Reconciler,
    key: &ResourceKey,
    service: &dyn ResourceService<R>,
    desired: &R::Desired,
) -> Result<R::Observed, ProviderError> {
    let name = R::name(desired);
    let outcome = ensure::ensure(service, desired).await?;
    let event = match &outcome {
        Ensured::Created(_) => {
            info!(step = R::KIND.as_str(), name, "Created");
            Some(ClusterEvent::normal(
                key,
                events::reasons::CREATED,
                format!("Created {} {name}", R::KIND),
            ))
        }
        Ensured::Updated(_) => {
            info!(step = R::KIND.as_str(), name, "Updated");
            Some(ClusterEvent::normal(
                key,
                events::reasons::UPDATED,
                format!("Updated {} {name}", R::KIND),
            ))
        }
        Ensured::Unchanged(_) => None,
    };
    if let Some(event) = event {
        ctx.events.publish(event).await;
    }
    Ok(outcome.into_inner())
}

/// Two phases: every group without rules, then the rules, which need the group ids
async fn ensure_security_groups(
    ctx: &Reconciler,
    key: &ResourceKey,
    services: &CloudServices,
    cluster: &ManagedResource,
    vpc_id: &str,
    port: u16,
) -> Result<BTreeMap<SecurityGroupRole, SecurityGroupStatus>, (String, ProviderError)> {
    let service = services.security_groups.as_ref();

    let mut ids = BTreeMap::new();
    for role in SecurityGroupRole::ALL {
        let desired = security_group::desired(cluster, role, vpc_id, port, None);
        let group = ensure_recorded(ctx, key, service, &desired)
            .await
            .map_err(|e| (desired.name.clone(), e))?;
        ids.insert(role, group.id);
    }

    let mut groups = BTreeMap::new();
    for role in SecurityGroupRole::ALL {
        let desired = security_group::desired(cluster, role, vpc_id, port, Some(&ids));
        let group = ensure_recorded(ctx, key, service, &desired)
            .await
            .map_err(|e| (desired.name.clone(), e))?;
        groups.insert(role, group);
    }
    Ok(groups)
}

/// First public subnet by availability zone, falling back to any subnet
fn bastion_subnet(vpc: &VpcStatus) -> Option<&SubnetStatus> {
    let mut subnets: Vec<&SubnetStatus> = vpc.subnets.iter().collect();
    subnets.sort_by(|a, b| {
        (!a.is_public, &a.availability_zone, &a.id).cmp(&(!b.is_public, &b.availability_zone, &b.id))
    });
    subnets.into_iter().next()
}

/// Every subnet zone is a failure domain; control plane ones are those the load
/// balancer spans
pub fn failure_domains(
    subnets: &[SubnetStatus],
    load_balancer_zones: &[String],
) -> BTreeMap<String, FailureDomain> {
    subnets
        .iter()
        .map(|s| {
            (
                s.availability_zone.clone(),
                FailureDomain {
                    control_plane: load_balancer_zones.contains(&s.availability_zone),
                },
            )
        })
        .collect()
}
