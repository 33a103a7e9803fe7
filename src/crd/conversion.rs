//! # Version Conversion
//!
//! Pure conversion between the legacy `v1alpha` spec and the current spec.
//!
//! The legacy version cannot represent every current field. Converting down stores those
//! fields as JSON under the conversion-data annotation; converting back up restores them,
//! so a round trip through the legacy version is lossless. Without the annotation the
//! fields come back with their defaults.

use crate::constants::CONVERSION_DATA_ANNOTATION;
use crate::crd::{
    AwsClusterSpec, BastionSpec, IdentityReference, LoadBalancerScheme, LoadBalancerSpec,
    NetworkSpec, SubnetSpec, Tags, VpcSpec,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Legacy API version of the AWSCluster spec
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterSpecV1Alpha {
    pub region: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub vpc_cidr: String,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub control_plane_load_balancer: Option<LoadBalancerSpecV1Alpha>,
    #[serde(default)]
    pub bastion_enabled: bool,
    #[serde(default)]
    pub bastion_allowed_cidr_blocks: Vec<String>,
    #[serde(default)]
    pub identity_ref: Option<IdentityReference>,
    #[serde(default)]
    pub additional_tags: Tags,
    #[serde(default)]
    pub ssh_key_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpecV1Alpha {
    #[serde(default)]
    pub scheme: LoadBalancerScheme,
    #[serde(default)]
    pub cross_zone_load_balancing: bool,
    #[serde(default)]
    pub idle_timeout_seconds: u32,
}

/// Fields only the current version can hold
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control_plane_instance_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_ami: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_security_groups: Vec<String>,
}

impl ConversionData {
    fn is_empty(&self) -> bool {
        *self == ConversionData::default()
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("malformed {CONVERSION_DATA_ANNOTATION} annotation: {0}")]
    MalformedAnnotation(#[from] serde_json::Error),
}

/// Convert a current spec down to the legacy version
///
/// Fields the legacy version cannot represent are written to the conversion-data
/// annotation; the annotation is removed when there is nothing to preserve.
pub fn to_v1alpha(
    spec: &AwsClusterSpec,
    annotations: &mut BTreeMap<String, String>,
) -> Result<AwsClusterSpecV1Alpha, ConversionError> {
    let lb = spec.control_plane_load_balancer.as_ref();
    let preserved = ConversionData {
        control_plane_instance_ids: spec.control_plane_instance_ids.clone(),
        bastion_instance_type: spec.bastion.instance_type.clone(),
        bastion_ami: spec.bastion.ami.clone(),
        load_balancer_name: lb.and_then(|l| l.name.clone()),
        health_check_protocol: lb.and_then(|l| l.health_check_protocol.clone()),
        additional_security_groups: lb
            .map(|l| l.additional_security_groups.clone())
            .unwrap_or_default(),
    };

    if preserved.is_empty() {
        annotations.remove(CONVERSION_DATA_ANNOTATION);
    } else {
        annotations.insert(
            CONVERSION_DATA_ANNOTATION.to_string(),
            serde_json::to_string(&preserved)?,
        );
    }

    Ok(AwsClusterSpecV1Alpha {
        region: spec.region.clone(),
        vpc_id: spec.network.vpc.id.clone(),
        vpc_cidr: spec.network.vpc.cidr_block.clone(),
        subnets: spec.network.subnets.clone(),
        control_plane_load_balancer: lb.map(|l| LoadBalancerSpecV1Alpha {
            scheme: l.scheme,
            cross_zone_load_balancing: l.cross_zone_load_balancing,
            idle_timeout_seconds: l.idle_timeout_seconds,
        }),
        bastion_enabled: spec.bastion.enabled,
        bastion_allowed_cidr_blocks: spec.bastion.allowed_cidr_blocks.clone(),
        identity_ref: spec.identity_ref.clone(),
        additional_tags: spec.additional_tags.clone(),
        ssh_key_name: spec.ssh_key_name.clone(),
    })
}

/// Convert a legacy spec up to the current version, restoring preserved fields
///
/// The conversion-data annotation is consumed: it is removed from `annotations`.
pub fn from_v1alpha(
    legacy: &AwsClusterSpecV1Alpha,
    annotations: &mut BTreeMap<String, String>,
) -> Result<AwsClusterSpec, ConversionError> {
    let restored = match annotations.remove(CONVERSION_DATA_ANNOTATION) {
        Some(raw) => serde_json::from_str::<ConversionData>(&raw)?,
        None => ConversionData::default(),
    };

    let has_lb_extras = restored.load_balancer_name.is_some()
        || restored.health_check_protocol.is_some()
        || !restored.additional_security_groups.is_empty();

    let control_plane_load_balancer = match &legacy.control_plane_load_balancer {
        Some(l) => Some(LoadBalancerSpec {
            name: restored.load_balancer_name.clone(),
            scheme: l.scheme,
            cross_zone_load_balancing: l.cross_zone_load_balancing,
            idle_timeout_seconds: l.idle_timeout_seconds,
            health_check_protocol: restored.health_check_protocol.clone(),
            additional_security_groups: restored.additional_security_groups.clone(),
        }),
        None if has_lb_extras => Some(LoadBalancerSpec {
            name: restored.load_balancer_name.clone(),
            health_check_protocol: restored.health_check_protocol.clone(),
            additional_security_groups: restored.additional_security_groups.clone(),
            ..LoadBalancerSpec::default()
        }),
        None => None,
    };

    Ok(AwsClusterSpec {
        region: legacy.region.clone(),
        network: NetworkSpec {
            vpc: VpcSpec {
                id: legacy.vpc_id.clone(),
                cidr_block: legacy.vpc_cidr.clone(),
            },
            subnets: legacy.subnets.clone(),
        },
        control_plane_load_balancer,
        bastion: BastionSpec {
            enabled: legacy.bastion_enabled,
            instance_type: restored.bastion_instance_type,
            ami: restored.bastion_ami,
            allowed_cidr_blocks: legacy.bastion_allowed_cidr_blocks.clone(),
        },
        identity_ref: legacy.identity_ref.clone(),
        additional_tags: legacy.additional_tags.clone(),
        control_plane_instance_ids: restored.control_plane_instance_ids,
        ssh_key_name: legacy.ssh_key_name.clone(),
    })
}
