//! # Bastion
//!
//! Single SSH jump host placed in a public subnet.

use super::{naming, ManagedResource, SubResource, SubResourceKind};
use crate::constants::DEFAULT_BASTION_INSTANCE_TYPE;
use crate::crd::tags::{build_tags, BuildParams, LIFECYCLE_OWNED};
use crate::crd::{BastionStatus, Tags};

pub const STATE_PENDING: &str = "pending";
pub const STATE_RUNNING: &str = "running";

/// Bastion sub-resource marker
#[derive(Debug)]
pub struct Bastion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionDesired {
    pub name: String,
    pub instance_type: String,
    pub ami: Option<String>,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub ssh_key_name: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionDiff {
    pub instance_type: String,
}

impl SubResource for Bastion {
    const KIND: SubResourceKind = SubResourceKind::Bastion;

    type Desired = BastionDesired;
    type Observed = BastionStatus;
    type Diff = BastionDiff;

    fn name(desired: &BastionDesired) -> &str {
        &desired.name
    }

    fn diff(desired: &BastionDesired, observed: &BastionStatus) -> Option<BastionDiff> {
        (desired.instance_type != observed.instance_type).then(|| BastionDiff {
            instance_type: desired.instance_type.clone(),
        })
    }
}

/// Deterministic bastion name, also used for teardown when the bastion is disabled
pub fn name(cluster: &ManagedResource) -> String {
    naming::bastion_name(&cluster.key.infra_name())
}

pub fn desired(cluster: &ManagedResource, subnet_id: &str, security_group_id: &str) -> BastionDesired {
    let infra = cluster.key.infra_name();
    let name = naming::bastion_name(&infra);
    let spec = &cluster.spec.bastion;
    let tags = build_tags(&BuildParams {
        infra_name: &infra,
        lifecycle: LIFECYCLE_OWNED,
        name: &name,
        role: "bastion",
        additional: &cluster.spec.additional_tags,
    });
    BastionDesired {
        name,
        instance_type: spec
            .instance_type
            .clone()
            .unwrap_or_else(|| DEFAULT_BASTION_INSTANCE_TYPE.to_string()),
        ami: spec.ami.clone(),
        subnet_id: subnet_id.to_string(),
        security_group_ids: vec![security_group_id.to_string()],
        ssh_key_name: cluster.spec.ssh_key_name.clone(),
        tags,
    }
}
