//! # Security Groups
//!
//! One group per role. Rules that reference other groups name them by role; they are
//! resolved to group ids once every group of the cluster exists.

use super::{naming, ManagedResource, SubResource, SubResourceKind};
use crate::crd::tags::{build_tags, BuildParams, LIFECYCLE_OWNED};
use crate::crd::{IngressRuleStatus, SecurityGroupStatus, Tags};
use std::collections::BTreeMap;
use std::fmt;

const ANYWHERE: &str = "0.0.0.0/0";
const SSH_PORT: i32 = 22;
const ETCD_PORTS: (i32, i32) = (2379, 2380);
const NODE_PORTS: (i32, i32) = (30000, 32767);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityGroupRole {
    Bastion,
    ApiServerLb,
    Lb,
    ControlPlane,
    Node,
}

impl SecurityGroupRole {
    pub const ALL: [SecurityGroupRole; 5] = [
        SecurityGroupRole::Bastion,
        SecurityGroupRole::ApiServerLb,
        SecurityGroupRole::Lb,
        SecurityGroupRole::ControlPlane,
        SecurityGroupRole::Node,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityGroupRole::Bastion => "bastion",
            SecurityGroupRole::ApiServerLb => "apiserver-lb",
            SecurityGroupRole::Lb => "lb",
            SecurityGroupRole::ControlPlane => "controlplane",
            SecurityGroupRole::Node => "node",
        }
    }
}

impl fmt::Display for SecurityGroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rule admits traffic from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Cidrs(Vec<String>),
    Roles(Vec<SecurityGroupRole>),
}

/// Ingress rule before group ids are known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRuleTemplate {
    pub description: &'static str,
    pub protocol: &'static str,
    pub from_port: i32,
    pub to_port: i32,
    pub source: RuleSource,
}

/// Security group sub-resource marker
#[derive(Debug)]
pub struct SecurityGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupDesired {
    pub name: String,
    pub role: SecurityGroupRole,
    pub vpc_id: String,
    /// `None` while other groups are still being created; rules are left untouched
    pub ingress: Option<Vec<IngressRuleStatus>>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityGroupDiff {
    pub authorize: Vec<IngressRuleStatus>,
    pub revoke: Vec<IngressRuleStatus>,
    pub tags: Tags,
}

impl SubResource for SecurityGroup {
    const KIND: SubResourceKind = SubResourceKind::SecurityGroup;

    type Desired = SecurityGroupDesired;
    type Observed = SecurityGroupStatus;
    type Diff = SecurityGroupDiff;

    fn name(desired: &SecurityGroupDesired) -> &str {
        &desired.name
    }

    fn diff(desired: &SecurityGroupDesired, observed: &SecurityGroupStatus) -> Option<SecurityGroupDiff> {
        let mut diff = SecurityGroupDiff {
            tags: desired.tags.difference(&observed.tags),
            ..SecurityGroupDiff::default()
        };
        if let Some(rules) = &desired.ingress {
            diff.authorize = rules
                .iter()
                .filter(|r| !observed.ingress_rules.contains(r))
                .cloned()
                .collect();
            diff.revoke = observed
                .ingress_rules
                .iter()
                .filter(|r| !rules.contains(r))
                .cloned()
                .collect();
        }
        if diff.tags.is_empty() && diff.authorize.is_empty() && diff.revoke.is_empty() {
            None
        } else {
            Some(diff)
        }
    }
}

/// Rules a role requires
pub fn ingress_rules(
    role: SecurityGroupRole,
    bastion_cidrs: &[String],
    api_server_port: u16,
) -> Vec<IngressRuleTemplate> {
    let api_port = i32::from(api_server_port);
    let ssh_from_bastion = IngressRuleTemplate {
        description: "SSH",
        protocol: "tcp",
        from_port: SSH_PORT,
        to_port: SSH_PORT,
        source: RuleSource::Roles(vec![SecurityGroupRole::Bastion]),
    };
    let api_from_anywhere = IngressRuleTemplate {
        description: "Kubernetes API",
        protocol: "tcp",
        from_port: api_port,
        to_port: api_port,
        source: RuleSource::Cidrs(vec![ANYWHERE.to_string()]),
    };
    match role {
        SecurityGroupRole::Bastion => {
            let cidrs = if bastion_cidrs.is_empty() {
                vec![ANYWHERE.to_string()]
            } else {
                bastion_cidrs.to_vec()
            };
            vec![IngressRuleTemplate {
                description: "SSH",
                protocol: "tcp",
                from_port: SSH_PORT,
                to_port: SSH_PORT,
                source: RuleSource::Cidrs(cidrs),
            }]
        }
        SecurityGroupRole::ControlPlane => vec![
            api_from_anywhere,
            ssh_from_bastion,
            IngressRuleTemplate {
                description: "etcd",
                protocol: "tcp",
                from_port: ETCD_PORTS.0,
                to_port: ETCD_PORTS.1,
                source: RuleSource::Roles(vec![SecurityGroupRole::ControlPlane]),
            },
        ],
        SecurityGroupRole::Node => vec![
            IngressRuleTemplate {
                description: "Node Port Services",
                protocol: "tcp",
                from_port: NODE_PORTS.0,
                to_port: NODE_PORTS.1,
                source: RuleSource::Cidrs(vec![ANYWHERE.to_string()]),
            },
            ssh_from_bastion,
            IngressRuleTemplate {
                description: "All traffic within the cluster",
                protocol: "-1",
                from_port: -1,
                to_port: -1,
                source: RuleSource::Roles(vec![
                    SecurityGroupRole::ControlPlane,
                    SecurityGroupRole::Node,
                ]),
            },
        ],
        SecurityGroupRole::ApiServerLb => vec![api_from_anywhere],
        SecurityGroupRole::Lb => Vec::new(),
    }
}

/// Resolve role references to group ids; rules naming a missing group are dropped
pub fn resolve_rules(
    templates: &[IngressRuleTemplate],
    group_ids: &BTreeMap<SecurityGroupRole, String>,
) -> Vec<IngressRuleStatus> {
    let mut rules: Vec<IngressRuleStatus> = templates
        .iter()
        .filter_map(|t| {
            let (cidr_blocks, source_security_group_ids) = match &t.source {
                RuleSource::Cidrs(c) => (super::sorted(c), Vec::new()),
                RuleSource::Roles(roles) => {
                    let ids: Option<Vec<String>> =
                        roles.iter().map(|r| group_ids.get(r).cloned()).collect();
                    (Vec::new(), super::sorted(&ids?))
                }
            };
            Some(IngressRuleStatus {
                description: t.description.to_string(),
                protocol: t.protocol.to_string(),
                from_port: t.from_port,
                to_port: t.to_port,
                cidr_blocks,
                source_security_group_ids,
            })
        })
        .collect();
    rules.sort();
    rules
}

/// Desired group for a role; `group_ids` is `None` while groups are still being created
pub fn desired(
    cluster: &ManagedResource,
    role: SecurityGroupRole,
    vpc_id: &str,
    api_server_port: u16,
    group_ids: Option<&BTreeMap<SecurityGroupRole, String>>,
) -> SecurityGroupDesired {
    let infra = cluster.key.infra_name();
    let name = naming::security_group_name(&infra, role);
    let tags = build_tags(&BuildParams {
        infra_name: &infra,
        lifecycle: LIFECYCLE_OWNED,
        name: &name,
        role: role.as_str(),
        additional: &cluster.spec.additional_tags,
    });
    let ingress = group_ids.map(|ids| {
        let templates = ingress_rules(
            role,
            &cluster.spec.bastion.allowed_cidr_blocks,
            api_server_port,
        );
        resolve_rules(&templates, ids)
    });
    SecurityGroupDesired {
        name,
        role,
        vpc_id: vpc_id.to_string(),
        ingress,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> BTreeMap<SecurityGroupRole, String> {
        SecurityGroupRole::ALL
            .iter()
            .enumerate()
            .map(|(i, r)| (*r, format!("sg-{i}")))
            .collect()
    }

    #[test]
    fn test_bastion_defaults_to_anywhere() {
        let rules = ingress_rules(SecurityGroupRole::Bastion, &[], 6443);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source, RuleSource::Cidrs(vec![ANYWHERE.to_string()]));
    }

    #[test]
    fn test_control_plane_rules_reference_groups() {
        let resolved = resolve_rules(
            &ingress_rules(SecurityGroupRole::ControlPlane, &[], 6443),
            &ids(),
        );
        assert_eq!(resolved.len(), 3);
        let etcd = resolved.iter().find(|r| r.description == "etcd").unwrap();
        assert_eq!(etcd.source_security_group_ids, vec!["sg-3".to_string()]);
        let api = resolved
            .iter()
            .find(|r| r.description == "Kubernetes API")
            .unwrap();
        assert_eq!(api.from_port, 6443);
    }

    #[test]
    fn test_lb_role_has_no_rules() {
        assert!(ingress_rules(SecurityGroupRole::Lb, &[], 6443).is_empty());
    }

    #[test]
    fn test_diff_authorizes_missing_and_revokes_extra() {
        let wanted = resolve_rules(&ingress_rules(SecurityGroupRole::ApiServerLb, &[], 6443), &ids());
        let stray = IngressRuleStatus {
            description: "stray".to_string(),
            protocol: "tcp".to_string(),
            from_port: 80,
            to_port: 80,
            cidr_blocks: vec![ANYWHERE.to_string()],
            source_security_group_ids: Vec::new(),
        };
        let desired = SecurityGroupDesired {
            name: "default-prod-apiserver-lb".to_string(),
            role: SecurityGroupRole::ApiServerLb,
            vpc_id: "vpc-1".to_string(),
            ingress: Some(wanted.clone()),
            tags: Tags::new(),
        };
        let observed = SecurityGroupStatus {
            id: "sg-1".to_string(),
            name: desired.name.clone(),
            ingress_rules: vec![stray.clone()],
            tags: Tags::new(),
        };
        let diff = SecurityGroup::diff(&desired, &observed).unwrap();
        assert_eq!(diff.authorize, wanted);
        assert_eq!(diff.revoke, vec![stray]);
    }

    #[test]
    fn test_unresolved_rules_leave_existing_rules_alone() {
        let desired = SecurityGroupDesired {
            name: "default-prod-node".to_string(),
            role: SecurityGroupRole::Node,
            vpc_id: "vpc-1".to_string(),
            ingress: None,
            tags: Tags::new(),
        };
        let observed = SecurityGroupStatus {
            id: "sg-1".to_string(),
            name: desired.name.clone(),
            ingress_rules: resolve_rules(&ingress_rules(SecurityGroupRole::Node, &[], 6443), &ids()),
            tags: Tags::new(),
        };
        assert!(SecurityGroup::diff(&desired, &observed).is_none());
    }
}
