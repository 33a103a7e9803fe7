//! # Custom Resource Definitions
//!
//! CRD types for the Cluster Infrastructure Controller.
//!
//! `AWSCluster` declares the network, security groups, bastion and control plane load
//! balancer of one cluster. Identity kinds live in [`identity`], the legacy API version in
//! [`conversion`].

pub mod conversion;
pub mod identity;
mod status;
pub mod tags;

pub use identity::*;
pub use status::*;
pub use tags::Tags;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AWSCluster Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: infrastructure.cluster.x-k8s.io/v1beta2
/// kind: AWSCluster
/// metadata:
///   name: prod
///   namespace: default
/// spec:
///   region: us-west-2
///   network:
///     vpc:
///       cidrBlock: 10.0.0.0/16
///     subnets:
///       - cidrBlock: 10.0.0.0/24
///         availabilityZone: us-west-2a
///         isPublic: true
///   bastion:
///     enabled: true
///   identityRef:
///     kind: AWSClusterRoleIdentity
///     name: prod-admin
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "AWSCluster",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    namespaced,
    status = "AwsClusterStatus",
    shortname = "awsc",
    printcolumn = r#"{"name":"Region", "type":"string", "jsonPath":".spec.region"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Endpoint", "type":"string", "jsonPath":".status.controlPlaneEndpoint.host"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterSpec {
    /// AWS region the cluster lives in
    pub region: String,
    /// VPC and subnet topology
    #[serde(default)]
    pub network: NetworkSpec,
    /// Control plane load balancer; `None` uses the defaults
    #[serde(default)]
    pub control_plane_load_balancer: Option<LoadBalancerSpec>,
    /// Bastion host settings
    #[serde(default)]
    pub bastion: BastionSpec,
    /// Identity used to call AWS; `None` means the controller identity
    #[serde(default)]
    pub identity_ref: Option<IdentityReference>,
    /// Extra tags merged onto every created object
    #[serde(default)]
    pub additional_tags: Tags,
    /// Control plane instances registered with the API server load balancer
    #[serde(default)]
    pub control_plane_instance_ids: Vec<String>,
    /// SSH key pair for the bastion
    #[serde(default)]
    pub ssh_key_name: Option<String>,
}

/// Network topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub vpc: VpcSpec,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
}

/// VPC settings
///
/// Setting `id` switches the network to unmanaged: the VPC is only described, never
/// created, updated or deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub cidr_block: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    pub cidr_block: String,
    pub availability_zone: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Load balancer scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LoadBalancerScheme {
    #[default]
    #[serde(rename = "internet-facing")]
    InternetFacing,
    #[serde(rename = "internal")]
    Internal,
}

impl LoadBalancerScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadBalancerScheme::InternetFacing => "internet-facing",
            LoadBalancerScheme::Internal => "internal",
        }
    }
}

/// Control plane load balancer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Explicit name; defaults to the derived `<infra>-apiserver` name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scheme: LoadBalancerScheme,
    #[serde(default)]
    pub cross_zone_load_balancing: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
    /// `TCP`, `SSL`, `HTTP` or `HTTPS`
    #[serde(default)]
    pub health_check_protocol: Option<String>,
    /// Security groups attached in addition to the managed `apiserver-lb` group
    #[serde(default)]
    pub additional_security_groups: Vec<String>,
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            name: None,
            scheme: LoadBalancerScheme::default(),
            cross_zone_load_balancing: false,
            idle_timeout_seconds: default_idle_timeout(),
            health_check_protocol: None,
            additional_security_groups: Vec::new(),
        }
    }
}

/// Bastion host settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub ami: Option<String>,
    /// CIDRs allowed to reach the bastion over SSH
    #[serde(default)]
    pub allowed_cidr_blocks: Vec<String>,
}

fn default_idle_timeout() -> u32 {
    crate::constants::DEFAULT_LB_IDLE_TIMEOUT_SECS
}

impl AwsClusterSpec {
    /// Load balancer settings with defaults applied when unset
    pub fn load_balancer(&self) -> LoadBalancerSpec {
        self.control_plane_load_balancer.clone().unwrap_or_default()
    }

    /// True when the VPC is provided by the user
    pub fn is_unmanaged_vpc(&self) -> bool {
        self.network.vpc.id.is_some()
    }
}
