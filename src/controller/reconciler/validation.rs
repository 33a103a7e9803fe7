//! # Validation
//!
//! Admission for AWSCluster specs and duration strings.
//!
//! Defaulting and validation run as plain functions before a spec is accepted: on
//! create every field is checked on its own, on update the immutable fields are also
//! compared against the stored spec.

use crate::constants::{DEFAULT_BASTION_INSTANCE_TYPE, DEFAULT_VPC_CIDR};
use crate::crd::{AwsClusterSpec, IdentityReference, LoadBalancerScheme, LoadBalancerSpec};
use crate::model::naming::MAX_LOAD_BALANCER_NAME_LEN;
use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

const ANYWHERE: &str = "0.0.0.0/0";
const HEALTH_CHECK_PROTOCOLS: [&str; 4] = ["TCP", "SSL", "HTTP", "HTTPS"];

/// Parse Kubernetes duration string into std::time::Duration
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
/// Returns Duration or error if format is invalid
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    // <number><unit>, unit one of s, m, h, d
    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let interval_lower = duration_trimmed.to_lowercase();

    let captures = duration_regex.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '15s', '10m', '1h')",
            duration_trimmed
        )
    })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid duration number in '{duration_trimmed}': {e}"))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let multiplier: u64 = match captures.name("unit").map(|m| m.as_str()) {
        Some("s") => 1,
        Some("m") => 60,
        Some("h") => 3600,
        Some("d") => 86400,
        other => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                other.unwrap_or_default(),
                duration_trimmed
            ));
        }
    };

    let seconds = number.checked_mul(multiplier).ok_or_else(|| {
        anyhow::anyhow!("Duration '{}' is too large", duration_trimmed)
    })?;

    Ok(Duration::from_secs(seconds))
}

/// One rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every field error found in one spec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// `a.b.c.d/n` or an IPv6 prefix
pub fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
    prefix.parse::<u8>().is_ok_and(|p| p <= max_prefix)
}

/// Fill in the values an omitted field stands for
pub fn apply_defaults(mut spec: AwsClusterSpec) -> AwsClusterSpec {
    if spec.network.vpc.id.is_none() && spec.network.vpc.cidr_block.is_empty() {
        spec.network.vpc.cidr_block = DEFAULT_VPC_CIDR.to_string();
    }
    if spec.bastion.enabled {
        if spec.bastion.instance_type.is_none() {
            spec.bastion.instance_type = Some(DEFAULT_BASTION_INSTANCE_TYPE.to_string());
        }
        if spec.bastion.allowed_cidr_blocks.is_empty() {
            spec.bastion.allowed_cidr_blocks = vec![ANYWHERE.to_string()];
        }
    }
    if spec.identity_ref.is_none() {
        spec.identity_ref = Some(IdentityReference::controller_default());
    }
    spec
}

/// Checks that do not depend on a previous version of the spec
pub fn validate_create(spec: &AwsClusterSpec) -> std::result::Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    check_fields(spec, &mut errors);
    errors.into_result()
}

/// Create checks plus immutability against the stored spec
pub fn validate_update(
    old: &AwsClusterSpec,
    new: &AwsClusterSpec,
) -> std::result::Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    check_fields(new, &mut errors);

    if old.region != new.region {
        errors.push("spec.region", "field is immutable");
    }

    if let Some(old_id) = &old.network.vpc.id {
        match &new.network.vpc.id {
            Some(new_id) if new_id == old_id => {}
            Some(_) => errors.push("spec.network.vpc.id", "field is immutable once set"),
            None => errors.push("spec.network.vpc.id", "field cannot be removed once set"),
        }
    }

    if old.identity_ref.is_some() && new.identity_ref.is_none() {
        errors.push("spec.identityRef", "field cannot be unset once set");
    }

    check_load_balancer_update(
        old.control_plane_load_balancer.as_ref(),
        new.control_plane_load_balancer.as_ref(),
        &mut errors,
    );

    errors.into_result()
}

fn check_load_balancer_update(
    old: Option<&LoadBalancerSpec>,
    new: Option<&LoadBalancerSpec>,
    errors: &mut ValidationErrors,
) {
    const FIELD: &str = "spec.controlPlaneLoadBalancer";
    match (old, new) {
        (Some(old), Some(new)) => {
            if old.scheme != new.scheme {
                errors.push(format!("{FIELD}.scheme"), "field is immutable");
            }
            if old.name != new.name {
                errors.push(format!("{FIELD}.name"), "field is immutable");
            }
            if old.health_check_protocol != new.health_check_protocol {
                errors.push(format!("{FIELD}.healthCheckProtocol"), "field is immutable");
            }
        }
        (None, Some(new)) => {
            // An unset load balancer was created with the defaults
            if new.scheme != LoadBalancerScheme::InternetFacing {
                errors.push(
                    format!("{FIELD}.scheme"),
                    "field is immutable, only the internet-facing default is allowed",
                );
            }
            if new.name.is_some() {
                errors.push(format!("{FIELD}.name"), "field is immutable");
            }
            if new.health_check_protocol.is_some() {
                errors.push(format!("{FIELD}.healthCheckProtocol"), "field is immutable");
            }
        }
        (Some(old), None) => {
            if old.scheme != LoadBalancerScheme::InternetFacing || old.name.is_some() {
                errors.push(FIELD, "field cannot be removed once customized");
            }
        }
        (None, None) => {}
    }
}

fn check_fields(spec: &AwsClusterSpec, errors: &mut ValidationErrors) {
    if spec.region.trim().is_empty() {
        errors.push("spec.region", "region is required");
    }

    for problem in spec.additional_tags.validate() {
        errors.push("spec.additionalTags", problem);
    }

    let vpc = &spec.network.vpc;
    if let Some(id) = &vpc.id {
        if id.trim().is_empty() {
            errors.push("spec.network.vpc.id", "must not be empty when set");
        }
    }
    if !vpc.cidr_block.is_empty() && !is_valid_cidr(&vpc.cidr_block) {
        errors.push(
            "spec.network.vpc.cidrBlock",
            format!("'{}' is not a valid CIDR block", vpc.cidr_block),
        );
    }

    for (i, subnet) in spec.network.subnets.iter().enumerate() {
        if !is_valid_cidr(&subnet.cidr_block) {
            errors.push(
                format!("spec.network.subnets[{i}].cidrBlock"),
                format!("'{}' is not a valid CIDR block", subnet.cidr_block),
            );
        }
        if subnet.availability_zone.trim().is_empty() {
            errors.push(
                format!("spec.network.subnets[{i}].availabilityZone"),
                "availability zone is required",
            );
        }
    }

    for (i, cidr) in spec.bastion.allowed_cidr_blocks.iter().enumerate() {
        if !is_valid_cidr(cidr) {
            errors.push(
                format!("spec.bastion.allowedCidrBlocks[{i}]"),
                format!("'{cidr}' is not a valid CIDR block"),
            );
        }
    }

    if let Some(lb) = &spec.control_plane_load_balancer {
        if let Some(name) = &lb.name {
            if name.is_empty() || name.len() > MAX_LOAD_BALANCER_NAME_LEN {
                errors.push(
                    "spec.controlPlaneLoadBalancer.name",
                    format!("must be 1 to {MAX_LOAD_BALANCER_NAME_LEN} characters"),
                );
            }
        }
        if let Some(protocol) = &lb.health_check_protocol {
            if !HEALTH_CHECK_PROTOCOLS.contains(&protocol.as_str()) {
                errors.push(
                    "spec.controlPlaneLoadBalancer.healthCheckProtocol",
                    format!("'{protocol}' must be one of {}", HEALTH_CHECK_PROTOCOLS.join(", ")),
                );
            }
        }
        if lb.idle_timeout_seconds == 0 || lb.idle_timeout_seconds > 4000 {
            errors.push(
                "spec.controlPlaneLoadBalancer.idleTimeoutSeconds",
                "must be between 1 and 4000",
            );
        }
    }

    if let Some(identity) = &spec.identity_ref {
        if identity.name.trim().is_empty() {
            errors.push("spec.identityRef.name", "identity name is required");
        }
    }

    for (i, id) in spec.control_plane_instance_ids.iter().enumerate() {
        if id.trim().is_empty() {
            errors.push(
                format!("spec.controlPlaneInstanceIds[{i}]"),
                "instance id must not be empty",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{IdentityKind, SubnetSpec};

    fn base() -> AwsClusterSpec {
        apply_defaults(AwsClusterSpec {
            region: "us-west-2".to_string(),
            ..AwsClusterSpec::default()
        })
    }

    #[test]
    fn test_parse_kubernetes_duration() {
        assert_eq!(parse_kubernetes_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_kubernetes_duration("10M").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_kubernetes_duration(" 1h ").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_kubernetes_duration("1d").unwrap(), Duration::from_secs(86400));
        assert!(parse_kubernetes_duration("").is_err());
        assert!(parse_kubernetes_duration("0s").is_err());
        assert!(parse_kubernetes_duration("5 minutes").is_err());
    }

    #[test]
    fn test_oversized_duration_is_an_error() {
        let err = parse_kubernetes_duration("999999999999999999d").unwrap_err();
        assert!(err.to_string().contains("too large"));
        assert!(parse_kubernetes_duration("99999999999999999999s").is_err());
        assert_eq!(
            parse_kubernetes_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_cidr_validation() {
        assert!(is_valid_cidr("10.0.0.0/16"));
        assert!(is_valid_cidr("2001:db8::/32"));
        assert!(!is_valid_cidr("10.0.0.0"));
        assert!(!is_valid_cidr("10.0.0.0/33"));
        assert!(!is_valid_cidr("not-a-cidr/8"));
    }

    #[test]
    fn test_defaults() {
        let mut spec = AwsClusterSpec {
            region: "us-west-2".to_string(),
            ..AwsClusterSpec::default()
        };
        spec.bastion.enabled = true;
        let spec = apply_defaults(spec);
        assert_eq!(spec.network.vpc.cidr_block, DEFAULT_VPC_CIDR);
        assert_eq!(spec.bastion.instance_type.as_deref(), Some("t3.micro"));
        assert_eq!(spec.bastion.allowed_cidr_blocks, vec![ANYWHERE.to_string()]);
        assert_eq!(
            spec.identity_ref.map(|r| r.kind),
            Some(IdentityKind::Controller)
        );
    }

    #[test]
    fn test_create_collects_every_field_error() {
        let mut spec = base();
        spec.region = String::new();
        spec.network.subnets.push(SubnetSpec {
            cidr_block: "10.0.0.0".to_string(),
            availability_zone: String::new(),
            is_public: true,
        });
        spec.additional_tags.insert("aws:reserved", "x");
        let errors = validate_create(&spec).unwrap_err();
        assert!(errors.has_field("spec.region"));
        assert!(errors.has_field("spec.network.subnets[0].cidrBlock"));
        assert!(errors.has_field("spec.network.subnets[0].availabilityZone"));
        assert!(errors.has_field("spec.additionalTags"));
    }

    #[test]
    fn test_region_is_immutable() {
        let old = base();
        let mut new = old.clone();
        new.region = "eu-west-1".to_string();
        let errors = validate_update(&old, &new).unwrap_err();
        assert!(errors.has_field("spec.region"));
    }

    #[test]
    fn test_vpc_id_cannot_change_or_be_removed() {
        let mut old = base();
        old.network.vpc.id = Some("vpc-123".to_string());

        let mut changed = old.clone();
        changed.network.vpc.id = Some("vpc-456".to_string());
        assert!(validate_update(&old, &changed).is_err());

        let mut removed = old.clone();
        removed.network.vpc.id = None;
        assert!(validate_update(&old, &removed).is_err());

        assert!(validate_update(&old, &old.clone()).is_ok());
    }

    #[test]
    fn test_identity_ref_may_change_but_not_be_unset() {
        let old = base();
        let mut changed = old.clone();
        changed.identity_ref = Some(IdentityReference {
            kind: IdentityKind::Role,
            name: "admin".to_string(),
        });
        assert!(validate_update(&old, &changed).is_ok());

        let mut unset = old.clone();
        unset.identity_ref = None;
        assert!(validate_update(&old, &unset)
            .unwrap_err()
            .has_field("spec.identityRef"));
    }

    #[test]
    fn test_load_balancer_scheme_is_immutable() {
        let old = base();
        let mut new = old.clone();
        new.control_plane_load_balancer = Some(LoadBalancerSpec {
            scheme: LoadBalancerScheme::Internal,
            ..LoadBalancerSpec::default()
        });
        assert!(validate_update(&old, &new)
            .unwrap_err()
            .has_field("spec.controlPlaneLoadBalancer.scheme"));

        // Spelling out the defaults is not a change
        let mut explicit = old.clone();
        explicit.control_plane_load_balancer = Some(LoadBalancerSpec::default());
        assert!(validate_update(&old, &explicit).is_ok());
    }

    #[test]
    fn test_mutable_load_balancer_attributes_may_change() {
        let mut old = base();
        old.control_plane_load_balancer = Some(LoadBalancerSpec::default());
        let mut new = old.clone();
        if let Some(lb) = new.control_plane_load_balancer.as_mut() {
            lb.idle_timeout_seconds = 300;
            lb.cross_zone_load_balancing = true;
        }
        assert!(validate_update(&old, &new).is_ok());
    }
}
