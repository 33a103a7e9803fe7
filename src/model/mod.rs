//! # Resource Graph Model
//!
//! In-memory view of a managed cluster and the sub-resources it owns.
//!
//! A [`ManagedResource`] pairs the user's desired spec with the observed status and the
//! metadata the engine depends on (finalizers, deletion timestamp, version token). Each
//! sub-resource kind implements [`SubResource`]: a deterministic external name and the
//! desired-vs-observed comparison that drives its ensure step.

pub mod attachment;
pub mod bastion;
pub mod load_balancer;
pub mod naming;
pub mod network;
pub mod security_group;

use crate::constants::{CLUSTER_FINALIZER, PAUSED_ANNOTATION};
use crate::controller::conditions::ConditionType;
use crate::crd::{AWSCluster, AwsClusterSpec, AwsClusterStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a managed resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Prefix for every external name and the ownership tag
    pub fn infra_name(&self) -> String {
        naming::infra_name(&self.namespace, &self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A cluster as loaded from the persistence layer
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedResource {
    pub key: ResourceKey,
    pub generation: i64,
    /// Optimistic concurrency token
    pub resource_version: String,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub spec: AwsClusterSpec,
    pub status: AwsClusterStatus,
}

impl ManagedResource {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == CLUSTER_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.annotations
            .get(PAUSED_ANNOTATION)
            .is_some_and(|v| v != "false")
    }

    /// Build from the Kubernetes object
    ///
    /// The deletion timestamp goes through JSON so the conversion does not depend on
    /// which time library k8s-openapi was built with.
    pub fn from_kube(obj: &AWSCluster) -> Option<Self> {
        let meta = &obj.metadata;
        let deletion_timestamp = meta
            .deletion_timestamp
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok())
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok());
        Some(Self {
            key: ResourceKey::new(meta.namespace.clone()?, meta.name.clone()?),
            generation: meta.generation.unwrap_or_default(),
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            finalizers: meta.finalizers.clone().unwrap_or_default(),
            deletion_timestamp,
            spec: obj.spec.clone(),
            status: obj.status.clone().unwrap_or_default(),
        })
    }
}

/// Sub-resource kinds in convergence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubResourceKind {
    Network,
    SecurityGroup,
    Bastion,
    LoadBalancer,
    InstanceAttachment,
}

impl SubResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubResourceKind::Network => "network",
            SubResourceKind::SecurityGroup => "security-group",
            SubResourceKind::Bastion => "bastion",
            SubResourceKind::LoadBalancer => "load-balancer",
            SubResourceKind::InstanceAttachment => "instance-attachment",
        }
    }

    /// Condition reporting the ensure step of this kind
    pub fn condition(self) -> ConditionType {
        match self {
            SubResourceKind::Network => ConditionType::NetworkReady,
            SubResourceKind::SecurityGroup => ConditionType::SecurityGroupsReady,
            SubResourceKind::Bastion => ConditionType::BastionReady,
            SubResourceKind::LoadBalancer => ConditionType::LoadBalancerReady,
            SubResourceKind::InstanceAttachment => ConditionType::InstancesRegistered,
        }
    }
}

impl fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind of external object owned by a cluster
pub trait SubResource: Send + Sync + 'static {
    const KIND: SubResourceKind;

    type Desired: Clone + fmt::Debug + Send + Sync;
    type Observed: Clone + fmt::Debug + PartialEq + Send + Sync;
    type Diff: Clone + fmt::Debug + Send + Sync;

    /// Deterministic external identity of the desired object
    fn name(desired: &Self::Desired) -> &str;

    /// Attributes that must change; `None` when observed already matches
    fn diff(desired: &Self::Desired, observed: &Self::Observed) -> Option<Self::Diff>;

    /// Differences that cannot be applied to an existing object
    fn conflict(_desired: &Self::Desired, _observed: &Self::Observed) -> Option<String> {
        None
    }

    /// Objects supplied by the user are only described, never created
    fn externally_owned(_desired: &Self::Desired) -> bool {
        false
    }
}

/// Sorted, de-duplicated copy of a list
pub(crate) fn sorted(items: &[String]) -> Vec<String> {
    let mut v = items.to_vec();
    v.sort();
    v.dedup();
    v
}
