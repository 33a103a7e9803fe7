//! # Resource Tags
//!
//! Tag maps applied to every external object, plus the ownership markers that let
//! teardown discover what a cluster owns without relying on status bookkeeping.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of the per-cluster ownership tag key
pub const CLUSTER_TAG_PREFIX: &str = "sigs.k8s.io/cluster-api-provider-aws/cluster/";

/// Tag key carrying the role of an object within its cluster
pub const ROLE_TAG_KEY: &str = "sigs.k8s.io/cluster-api-provider-aws/role";

/// Tag key carrying the human-readable object name
pub const NAME_TAG_KEY: &str = "Name";

/// Tag value for objects whose lifecycle is tied to the cluster
pub const LIFECYCLE_OWNED: &str = "owned";

/// Tag value for objects the cluster uses but must never delete
pub const LIFECYCLE_SHARED: &str = "shared";

const MAX_KEY_LEN: usize = 128;
const MAX_VALUE_LEN: usize = 256;
const RESERVED_PREFIX: &str = "aws:";

/// Ordered tag map
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Tags(pub BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into self; keys present in both take the value from `other`
    pub fn merge(&mut self, other: &Tags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Tags in self that are missing from `other` or carry a different value there
    pub fn difference(&self, other: &Tags) -> Tags {
        Tags(
            self.0
                .iter()
                .filter(|(k, v)| other.0.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// True when every tag in `required` is present with the same value
    pub fn contains_all(&self, required: &Tags) -> bool {
        required.difference(self).is_empty()
    }

    /// Validate keys and values against provider limits
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (k, v) in &self.0 {
            if k.is_empty() {
                errors.push("tag key cannot be empty".to_string());
                continue;
            }
            if k.len() > MAX_KEY_LEN {
                errors.push(format!(
                    "tag key '{k}' exceeds {MAX_KEY_LEN} characters"
                ));
            }
            if v.len() > MAX_VALUE_LEN {
                errors.push(format!(
                    "tag value for key '{k}' exceeds {MAX_VALUE_LEN} characters"
                ));
            }
            if k.starts_with(RESERVED_PREFIX) {
                errors.push(format!(
                    "tag key '{k}' uses the reserved '{RESERVED_PREFIX}' prefix"
                ));
            }
        }
        errors
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Tags(iter.into_iter().collect())
    }
}

/// Ownership tag key for a cluster's infrastructure name
pub fn cluster_tag_key(infra_name: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{infra_name}")
}

/// Inputs for [`build_tags`]
#[derive(Debug, Clone)]
pub struct BuildParams<'a> {
    pub infra_name: &'a str,
    pub lifecycle: &'a str,
    pub name: &'a str,
    pub role: &'a str,
    pub additional: &'a Tags,
}

/// Build the full tag set for an external object
///
/// User-supplied tags are applied first so the ownership markers can never be
/// overridden by `additionalTags`.
pub fn build_tags(params: &BuildParams<'_>) -> Tags {
    let mut tags = params.additional.clone();
    tags.insert(cluster_tag_key(params.infra_name), params.lifecycle);
    tags.insert(ROLE_TAG_KEY, params.role);
    tags.insert(NAME_TAG_KEY, params.name);
    tags
}

/// True when the tag set marks the object as owned by the given cluster
pub fn is_owned_by(tags: &Tags, infra_name: &str) -> bool {
    tags.get(&cluster_tag_key(infra_name)) == Some(LIFECYCLE_OWNED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_merge_other_wins_on_overlap() {
        let mut base = tags(&[("a", "b"), ("c", "d")]);
        base.merge(&tags(&[("1", "2"), ("a", "hello")]));
        assert_eq!(base, tags(&[("a", "hello"), ("c", "d"), ("1", "2")]));
    }

    #[test]
    fn test_merge_empty_is_noop() {
        let mut base = tags(&[("a", "b")]);
        base.merge(&Tags::new());
        assert_eq!(base, tags(&[("a", "b")]));
    }

    #[test]
    fn test_difference_reports_missing_and_changed() {
        let desired = tags(&[("a", "b"), ("c", "d"), ("e", "f")]);
        let actual = tags(&[("a", "b"), ("c", "x")]);
        assert_eq!(desired.difference(&actual), tags(&[("c", "d"), ("e", "f")]));
        assert!(!actual.contains_all(&desired));
        assert!(desired.contains_all(&tags(&[("a", "b")])));
    }

    #[test]
    fn test_validate_rejects_reserved_and_oversized() {
        let long_key = "k".repeat(129);
        let t = tags(&[("aws:cloudformation", "x"), (long_key.as_str(), "v")]);
        let errors = t.validate();
        assert_eq!(errors.len(), 2);
        assert!(tags(&[("team", "infra")]).validate().is_empty());
    }

    #[test]
    fn test_build_tags_owner_markers_win() {
        let additional = tags(&[("Name", "spoofed"), ("team", "infra")]);
        let built = build_tags(&BuildParams {
            infra_name: "default-prod",
            lifecycle: LIFECYCLE_OWNED,
            name: "default-prod-vpc",
            role: "common",
            additional: &additional,
        });
        assert_eq!(built.get(NAME_TAG_KEY), Some("default-prod-vpc"));
        assert_eq!(built.get("team"), Some("infra"));
        assert!(is_owned_by(&built, "default-prod"));
        assert!(!is_owned_by(&built, "default-staging"));
    }
}
