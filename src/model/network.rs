//! # Network
//!
//! VPC and subnets. A user-supplied VPC id makes the network unmanaged: it is described
//! but never created, changed or deleted.

use super::{naming, ManagedResource, SubResource, SubResourceKind};
use crate::crd::tags::{build_tags, BuildParams, LIFECYCLE_OWNED, LIFECYCLE_SHARED};
use crate::crd::{SubnetSpec, Tags, VpcStatus};

/// Network sub-resource marker
#[derive(Debug)]
pub struct Network;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDesired {
    /// VPC name for managed networks, VPC id for unmanaged ones
    pub name: String,
    pub managed: bool,
    pub cidr_block: String,
    pub subnets: Vec<SubnetSpec>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDiff {
    pub tags: Tags,
    pub missing_subnets: Vec<SubnetSpec>,
}

impl SubResource for Network {
    const KIND: SubResourceKind = SubResourceKind::Network;

    type Desired = NetworkDesired;
    type Observed = VpcStatus;
    type Diff = NetworkDiff;

    fn name(desired: &NetworkDesired) -> &str {
        &desired.name
    }

    fn diff(desired: &NetworkDesired, observed: &VpcStatus) -> Option<NetworkDiff> {
        if !desired.managed {
            return None;
        }
        let tags = desired.tags.difference(&observed.tags);
        let missing_subnets: Vec<SubnetSpec> = desired
            .subnets
            .iter()
            .filter(|s| {
                !observed
                    .subnets
                    .iter()
                    .any(|o| o.cidr_block == s.cidr_block)
            })
            .cloned()
            .collect();
        if tags.is_empty() && missing_subnets.is_empty() {
            None
        } else {
            Some(NetworkDiff {
                tags,
                missing_subnets,
            })
        }
    }

    fn conflict(desired: &NetworkDesired, observed: &VpcStatus) -> Option<String> {
        (desired.managed && desired.cidr_block != observed.cidr_block).then(|| {
            format!(
                "VPC {} has CIDR {} but {} is requested; the CIDR of an existing VPC cannot change",
                observed.id, observed.cidr_block, desired.cidr_block
            )
        })
    }

    fn externally_owned(desired: &NetworkDesired) -> bool {
        !desired.managed
    }
}

/// Desired network for a cluster
pub fn desired(cluster: &ManagedResource) -> NetworkDesired {
    let infra = cluster.key.infra_name();
    let vpc = &cluster.spec.network.vpc;
    let managed = vpc.id.is_none();
    let name = vpc.id.clone().unwrap_or_else(|| naming::vpc_name(&infra));
    let tags = build_tags(&BuildParams {
        infra_name: &infra,
        lifecycle: if managed {
            LIFECYCLE_OWNED
        } else {
            LIFECYCLE_SHARED
        },
        name: &name,
        role: "common",
        additional: &cluster.spec.additional_tags,
    });
    NetworkDesired {
        name,
        managed,
        cidr_block: vpc.cidr_block.clone(),
        subnets: cluster.spec.network.subnets.clone(),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SubnetStatus;

    fn desired_net(managed: bool) -> NetworkDesired {
        NetworkDesired {
            name: "default-prod-vpc".to_string(),
            managed,
            cidr_block: "10.0.0.0/16".to_string(),
            subnets: vec![
                SubnetSpec {
                    cidr_block: "10.0.0.0/24".to_string(),
                    availability_zone: "us-west-2a".to_string(),
                    is_public: true,
                },
                SubnetSpec {
                    cidr_block: "10.0.1.0/24".to_string(),
                    availability_zone: "us-west-2b".to_string(),
                    is_public: false,
                },
            ],
            tags: [("team".to_string(), "infra".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn observed_with_first_subnet() -> VpcStatus {
        VpcStatus {
            id: "vpc-1".to_string(),
            cidr_block: "10.0.0.0/16".to_string(),
            managed: true,
            subnets: vec![SubnetStatus {
                id: "subnet-1".to_string(),
                cidr_block: "10.0.0.0/24".to_string(),
                availability_zone: "us-west-2a".to_string(),
                is_public: true,
            }],
            tags: Tags::new(),
        }
    }

    #[test]
    fn test_diff_reports_missing_subnets_and_tags() {
        let diff = Network::diff(&desired_net(true), &observed_with_first_subnet()).unwrap();
        assert_eq!(diff.missing_subnets.len(), 1);
        assert_eq!(diff.missing_subnets[0].cidr_block, "10.0.1.0/24");
        assert_eq!(diff.tags.get("team"), Some("infra"));
    }

    #[test]
    fn test_unmanaged_network_never_diffs() {
        assert!(Network::diff(&desired_net(false), &observed_with_first_subnet()).is_none());
    }

    #[test]
    fn test_cidr_change_is_a_conflict() {
        let mut observed = observed_with_first_subnet();
        observed.cidr_block = "172.16.0.0/16".to_string();
        assert!(Network::conflict(&desired_net(true), &observed).is_some());
        assert!(Network::conflict(&desired_net(false), &observed).is_none());
    }
}
