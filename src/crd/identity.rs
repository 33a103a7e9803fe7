//! # Identity Types
//!
//! Cluster-scoped objects that supply AWS credentials to clusters.
//!
//! Each kind carries an optional namespace allow-list: absent denies every namespace,
//! an empty list allows all of them, and a populated list allows exactly its members.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of credential-providing object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum IdentityKind {
    #[serde(rename = "AWSClusterControllerIdentity")]
    Controller,
    #[serde(rename = "AWSClusterRoleIdentity")]
    Role,
    #[serde(rename = "AWSClusterStaticIdentity")]
    Static,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentityKind::Controller => "AWSClusterControllerIdentity",
            IdentityKind::Role => "AWSClusterRoleIdentity",
            IdentityKind::Static => "AWSClusterStaticIdentity",
        };
        f.write_str(s)
    }
}

/// Named, kinded pointer to an identity object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct IdentityReference {
    pub kind: IdentityKind,
    pub name: String,
}

impl IdentityReference {
    /// The controller identity used when a cluster carries no reference
    pub fn controller_default() -> Self {
        Self {
            kind: IdentityKind::Controller,
            name: crate::constants::DEFAULT_CONTROLLER_IDENTITY.to_string(),
        }
    }
}

impl fmt::Display for IdentityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Namespaces permitted to use an identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AllowedNamespaces {
    #[serde(default)]
    pub list: Vec<String>,
}

/// Apply the allow-list rules to a namespace
pub fn namespace_allowed(allowed: Option<&AllowedNamespaces>, namespace: &str) -> bool {
    match allowed {
        None => false,
        Some(a) if a.list.is_empty() => true,
        Some(a) => a.list.iter().any(|ns| ns == namespace),
    }
}

/// Singleton identity backed by the controller's own credentials
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "AWSClusterControllerIdentity",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2"
)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterControllerIdentitySpec {
    #[serde(default)]
    pub allowed_namespaces: Option<AllowedNamespaces>,
}

/// Identity that assumes an IAM role, optionally through another identity
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "AWSClusterRoleIdentity",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2"
)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterRoleIdentitySpec {
    pub role_arn: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i32>,
    #[serde(default)]
    pub inline_policy: Option<String>,
    /// Identity whose credentials call STS; defaults to the controller identity
    #[serde(default)]
    pub source_identity_ref: Option<IdentityReference>,
    #[serde(default)]
    pub allowed_namespaces: Option<AllowedNamespaces>,
}

/// Identity backed by static keys stored in a Secret in the controller namespace
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "AWSClusterStaticIdentity",
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2"
)]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterStaticIdentitySpec {
    /// Secret holding `AccessKeyID`, `SecretAccessKey` and optionally `SessionToken`
    pub secret_ref: String,
    #[serde(default)]
    pub allowed_namespaces: Option<AllowedNamespaces>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_allow_list_denies() {
        assert!(!namespace_allowed(None, "default"));
    }

    #[test]
    fn test_empty_allow_list_allows_all() {
        let allowed = AllowedNamespaces::default();
        assert!(namespace_allowed(Some(&allowed), "default"));
        assert!(namespace_allowed(Some(&allowed), "team-a"));
    }

    #[test]
    fn test_populated_allow_list_is_exact() {
        let allowed = AllowedNamespaces {
            list: vec!["team-a".to_string()],
        };
        assert!(namespace_allowed(Some(&allowed), "team-a"));
        assert!(!namespace_allowed(Some(&allowed), "team-b"));
    }

    #[test]
    fn test_identity_kind_wire_names() {
        let r: IdentityReference =
            serde_json::from_str(r#"{"kind":"AWSClusterRoleIdentity","name":"admin"}"#).unwrap();
        assert_eq!(r.kind, IdentityKind::Role);
        assert_eq!(r.to_string(), "AWSClusterRoleIdentity/admin");
    }
}
