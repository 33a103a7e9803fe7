//! # Load Balancer
//!
//! API server load balancer. Attributes, subnets, security groups and tags converge
//! individually; the scheme of an existing load balancer cannot change.

use super::{naming, sorted, ManagedResource, SubResource, SubResourceKind};
use crate::crd::tags::{build_tags, BuildParams, LIFECYCLE_OWNED};
use crate::crd::{LoadBalancerScheme, LoadBalancerStatus, Tags};

/// Load balancer sub-resource marker
#[derive(Debug)]
pub struct LoadBalancer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerDesired {
    pub name: String,
    pub scheme: LoadBalancerScheme,
    pub subnet_ids: Vec<String>,
    pub availability_zones: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub cross_zone_load_balancing: bool,
    pub idle_timeout_seconds: u32,
    pub health_check_protocol: String,
    pub listener_port: u16,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadBalancerDiff {
    pub cross_zone_load_balancing: Option<bool>,
    pub idle_timeout_seconds: Option<u32>,
    pub subnet_ids: Option<Vec<String>>,
    pub availability_zones: Option<Vec<String>>,
    pub security_group_ids: Option<Vec<String>>,
    pub tags: Tags,
}

impl LoadBalancerDiff {
    fn is_empty(&self) -> bool {
        self.cross_zone_load_balancing.is_none()
            && self.idle_timeout_seconds.is_none()
            && self.subnet_ids.is_none()
            && self.security_group_ids.is_none()
            && self.tags.is_empty()
    }
}

impl SubResource for LoadBalancer {
    const KIND: SubResourceKind = SubResourceKind::LoadBalancer;

    type Desired = LoadBalancerDesired;
    type Observed = LoadBalancerStatus;
    type Diff = LoadBalancerDiff;

    fn name(desired: &LoadBalancerDesired) -> &str {
        &desired.name
    }

    fn diff(desired: &LoadBalancerDesired, observed: &LoadBalancerStatus) -> Option<LoadBalancerDiff> {
        let subnets_changed = sorted(&desired.subnet_ids) != sorted(&observed.subnet_ids);
        let diff = LoadBalancerDiff {
            cross_zone_load_balancing: (desired.cross_zone_load_balancing
                != observed.cross_zone_load_balancing)
                .then_some(desired.cross_zone_load_balancing),
            idle_timeout_seconds: (desired.idle_timeout_seconds != observed.idle_timeout_seconds)
                .then_some(desired.idle_timeout_seconds),
            subnet_ids: subnets_changed.then(|| sorted(&desired.subnet_ids)),
            availability_zones: subnets_changed.then(|| sorted(&desired.availability_zones)),
            security_group_ids: (sorted(&desired.security_group_ids)
                != sorted(&observed.security_group_ids))
            .then(|| sorted(&desired.security_group_ids)),
            tags: desired.tags.difference(&observed.tags),
        };
        (!diff.is_empty()).then_some(diff)
    }

    fn conflict(desired: &LoadBalancerDesired, observed: &LoadBalancerStatus) -> Option<String> {
        (desired.scheme.as_str() != observed.scheme).then(|| {
            format!(
                "load balancer {} has scheme {} but {} is requested; the scheme cannot change",
                observed.name,
                observed.scheme,
                desired.scheme.as_str()
            )
        })
    }
}

/// Name used for the API server load balancer of a cluster
pub fn name(cluster: &ManagedResource) -> String {
    cluster
        .spec
        .control_plane_load_balancer
        .as_ref()
        .and_then(|lb| lb.name.clone())
        .unwrap_or_else(|| naming::load_balancer_name(&cluster.key.infra_name()))
}

/// Desired load balancer given the observed subnets and the `apiserver-lb` group
pub fn desired(
    cluster: &ManagedResource,
    subnets: &[crate::crd::SubnetStatus],
    api_server_lb_group_id: &str,
    api_server_port: u16,
) -> LoadBalancerDesired {
    let infra = cluster.key.infra_name();
    let spec = cluster.spec.load_balancer();
    let name = name(cluster);
    let public = spec.scheme == LoadBalancerScheme::InternetFacing;
    let chosen: Vec<_> = subnets.iter().filter(|s| s.is_public == public).collect();

    let mut security_group_ids = vec![api_server_lb_group_id.to_string()];
    security_group_ids.extend(spec.additional_security_groups.iter().cloned());

    let tags = build_tags(&BuildParams {
        infra_name: &infra,
        lifecycle: LIFECYCLE_OWNED,
        name: &name,
        role: "apiserver",
        additional: &cluster.spec.additional_tags,
    });

    LoadBalancerDesired {
        name,
        scheme: spec.scheme,
        subnet_ids: sorted(&chosen.iter().map(|s| s.id.clone()).collect::<Vec<_>>()),
        availability_zones: sorted(
            &chosen
                .iter()
                .map(|s| s.availability_zone.clone())
                .collect::<Vec<_>>(),
        ),
        security_group_ids: sorted(&security_group_ids),
        cross_zone_load_balancing: spec.cross_zone_load_balancing,
        idle_timeout_seconds: spec.idle_timeout_seconds,
        health_check_protocol: spec
            .health_check_protocol
            .clone()
            .unwrap_or_else(|| "TCP".to_string()),
        listener_port: api_server_port,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired_lb() -> LoadBalancerDesired {
        LoadBalancerDesired {
            name: "default-prod-apiserver".to_string(),
            scheme: LoadBalancerScheme::InternetFacing,
            subnet_ids: vec!["subnet-1".to_string()],
            availability_zones: vec!["us-west-2a".to_string()],
            security_group_ids: vec!["sg-1".to_string()],
            cross_zone_load_balancing: true,
            idle_timeout_seconds: 60,
            health_check_protocol: "TCP".to_string(),
            listener_port: 6443,
            tags: Tags::new(),
        }
    }

    fn observed_lb() -> LoadBalancerStatus {
        LoadBalancerStatus {
            name: "default-prod-apiserver".to_string(),
            dns_name: String::new(),
            scheme: "internet-facing".to_string(),
            subnet_ids: vec!["subnet-1".to_string()],
            security_group_ids: vec!["sg-1".to_string()],
            availability_zones: vec!["us-west-2a".to_string()],
            cross_zone_load_balancing: true,
            idle_timeout_seconds: 60,
            tags: Tags::new(),
        }
    }

    #[test]
    fn test_matching_load_balancer_has_no_diff() {
        assert!(LoadBalancer::diff(&desired_lb(), &observed_lb()).is_none());
    }

    #[test]
    fn test_only_changed_attributes_are_reported() {
        let mut observed = observed_lb();
        observed.idle_timeout_seconds = 300;
        let diff = LoadBalancer::diff(&desired_lb(), &observed).unwrap();
        assert_eq!(diff.idle_timeout_seconds, Some(60));
        assert!(diff.cross_zone_load_balancing.is_none());
        assert!(diff.subnet_ids.is_none());
        assert!(diff.security_group_ids.is_none());
    }

    #[test]
    fn test_scheme_change_conflicts() {
        let mut observed = observed_lb();
        observed.scheme = "internal".to_string();
        assert!(LoadBalancer::conflict(&desired_lb(), &observed).is_some());
    }
}
