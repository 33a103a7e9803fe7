//! # Status Types
//!
//! Observed state written back by the convergence engine.

use crate::controller::conditions::Conditions;
use crate::crd::Tags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// AWSCluster status
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterStatus {
    /// True once the control plane endpoint resolves and every step converged
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub network: NetworkStatus,
    #[serde(default)]
    pub bastion: Option<BastionStatus>,
    /// Availability zone -> failure domain
    #[serde(default)]
    pub failure_domains: BTreeMap<String, FailureDomain>,
    #[serde(default)]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Observed network objects
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub vpc: Option<VpcStatus>,
    /// Security group role -> observed group
    #[serde(default)]
    pub security_groups: BTreeMap<String, SecurityGroupStatus>,
    #[serde(default, rename = "apiServerElb")]
    pub api_server_elb: Option<LoadBalancerStatus>,
    /// Instances currently registered with the API server load balancer
    #[serde(default)]
    pub registered_instances: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatus {
    pub id: String,
    pub cidr_block: String,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub subnets: Vec<SubnetStatus>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    pub id: String,
    pub cidr_block: String,
    pub availability_zone: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupStatus {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ingress_rules: Vec<IngressRuleStatus>,
    #[serde(default)]
    pub tags: Tags,
}

/// Ingress rule as observed on a security group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRuleStatus {
    pub description: String,
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
    #[serde(default)]
    pub source_security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BastionStatus {
    pub instance_id: String,
    pub instance_type: String,
    /// `pending`, `running`, `stopping` or `terminated`
    pub state: String,
    #[serde(default)]
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    pub name: String,
    /// Empty until the provider publishes the DNS name
    #[serde(default)]
    pub dns_name: String,
    pub scheme: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub availability_zones: Vec<String>,
    #[serde(default)]
    pub cross_zone_load_balancing: bool,
    #[serde(default)]
    pub idle_timeout_seconds: u32,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomain {
    #[serde(default)]
    pub control_plane: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}
