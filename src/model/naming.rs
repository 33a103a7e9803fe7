//! # Deterministic Naming
//!
//! External names derived from a cluster's identity. Re-running an ensure step after a
//! crash looks up the same names, so it finds the existing object instead of creating a
//! duplicate.

use crate::model::security_group::SecurityGroupRole;
use sha2::{Digest, Sha256};

/// Longest name the load balancer API accepts
pub const MAX_LOAD_BALANCER_NAME_LEN: usize = 32;

const HASHED_NAME_LEN: usize = 28;
const HASHED_NAME_SUFFIX: &str = "-k8s";
const API_SERVER_ROLE: &str = "apiserver";

/// Infrastructure name of a cluster: `<namespace>-<name>` with dots replaced
pub fn infra_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}").replace('.', "-")
}

pub fn vpc_name(infra: &str) -> String {
    format!("{infra}-vpc")
}

pub fn subnet_name(infra: &str, availability_zone: &str, is_public: bool) -> String {
    let visibility = if is_public { "public" } else { "private" };
    format!("{infra}-subnet-{visibility}-{availability_zone}")
}

/// Security group name; names beginning with `sg-` are reserved for group ids
pub fn security_group_name(infra: &str, role: SecurityGroupRole) -> String {
    let name = format!("{infra}-{}", role.as_str());
    if name.starts_with("sg-") {
        format!("@{name}")
    } else {
        name
    }
}

pub fn bastion_name(infra: &str) -> String {
    format!("{infra}-bastion")
}

/// API server load balancer name
///
/// `<infra>-apiserver` when it fits, otherwise a base36 SHA-256 digest of the infra
/// name truncated to 28 characters and suffixed with `-k8s`.
pub fn load_balancer_name(infra: &str) -> String {
    let standard = format!("{infra}-{API_SERVER_ROLE}");
    if standard.len() <= MAX_LOAD_BALANCER_NAME_LEN {
        return standard;
    }
    let mut hashed = base36_sha256(infra);
    hashed.truncate(HASHED_NAME_LEN);
    format!("{hashed}{HASHED_NAME_SUFFIX}")
}

/// Base36 rendering of the SHA-256 digest read as a big-endian integer
fn base36_sha256(input: &str) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut digits: Vec<u8> = Sha256::digest(input.as_bytes()).to_vec();
    let mut out = Vec::new();
    while digits.iter().any(|d| *d != 0) {
        let mut remainder: u32 = 0;
        for d in &mut digits {
            let acc = (remainder << 8) | u32::from(*d);
            *d = u8::try_from(acc / 36).unwrap_or(u8::MAX);
            remainder = acc % 36;
        }
        out.push(ALPHABET[remainder as usize]);
    }
    if out.is_empty() {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infra_name_includes_namespace_and_replaces_dots() {
        assert_eq!(infra_name("default", "prod.eu"), "default-prod-eu");
        assert_ne!(infra_name("team-a", "prod"), infra_name("team-b", "prod"));
    }

    #[test]
    fn test_short_load_balancer_name_is_standard() {
        assert_eq!(load_balancer_name("default-prod"), "default-prod-apiserver");
    }

    #[test]
    fn test_long_load_balancer_name_is_hashed_and_stable() {
        let infra = "a-very-long-namespace-with-a-long-cluster-name";
        let name = load_balancer_name(infra);
        assert_eq!(name.len(), MAX_LOAD_BALANCER_NAME_LEN);
        assert!(name.ends_with("-k8s"));
        assert!(name[..28]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(name, load_balancer_name(infra));
        assert_ne!(name, load_balancer_name("another-very-long-namespace-and-cluster"));
    }

    #[test]
    fn test_security_group_name_avoids_id_prefix() {
        assert_eq!(
            security_group_name("default-prod", SecurityGroupRole::Node),
            "default-prod-node"
        );
        assert_eq!(
            security_group_name("sg-prod", SecurityGroupRole::Bastion),
            "@sg-prod-bastion"
        );
    }

    #[test]
    fn test_base36_of_known_digest_has_expected_alphabet() {
        let encoded = base36_sha256("cluster");
        // 256-bit value needs at most 50 base36 digits
        assert!(encoded.len() <= 50 && encoded.len() > 40);
    }
}
