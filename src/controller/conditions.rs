//! # Condition Tracker
//!
//! Typed per-aspect conditions with severities, plus the summary that derives the
//! aggregate `Ready` condition.
//!
//! At most one condition exists per type. The list is kept sorted by type so that the
//! serialized status never depends on insertion order. `last_transition_time` moves
//! only when a condition's status changes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable reason codes
pub mod reasons {
    pub const WAIT_FOR_DNS_NAME: &str = "WaitForDNSName";
    pub const WAIT_FOR_DNS_NAME_RESOLVE: &str = "WaitForDNSNameResolve";
    pub const INSTANCE_NOT_READY: &str = "InstanceNotReady";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const DELETING: &str = "Deleting";
    pub const DELETION_FAILED: &str = "DeletionFailed";
    pub const PENDING: &str = "Pending";
    pub const NETWORK_FAILED: &str = "NetworkReconciliationFailed";
    pub const SECURITY_GROUPS_FAILED: &str = "SecurityGroupReconciliationFailed";
    pub const BASTION_FAILED: &str = "BastionHostFailed";
    pub const LOAD_BALANCER_FAILED: &str = "LoadBalancerFailed";
    pub const INSTANCE_REGISTRATION_FAILED: &str = "InstanceRegistrationFailed";
    pub const PRINCIPAL_CREDENTIAL_RETRIEVAL_FAILED: &str = "PrincipalCredentialRetrievalFailed";
    pub const NAMESPACE_NOT_PERMITTED: &str = "NamespaceNotPermitted";
}

/// Condition types, in the order they are reported
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ConditionType {
    Ready,
    PrincipalCredentialRetrieved,
    PrincipalUsageAllowed,
    NetworkReady,
    SecurityGroupsReady,
    BastionReady,
    LoadBalancerReady,
    InstancesRegistered,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::PrincipalCredentialRetrieved => "PrincipalCredentialRetrieved",
            ConditionType::PrincipalUsageAllowed => "PrincipalUsageAllowed",
            ConditionType::NetworkReady => "NetworkReady",
            ConditionType::SecurityGroupsReady => "SecurityGroupsReady",
            ConditionType::BastionReady => "BastionReady",
            ConditionType::LoadBalancerReady => "LoadBalancerReady",
            ConditionType::InstancesRegistered => "InstancesRegistered",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Severity of a non-True condition; ordering is Info < Warning < Error
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Assigned by [`Conditions::set`]
    #[schemars(with = "String")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn true_(type_: ConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn false_(
        type_: ConditionType,
        severity: Severity,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn unknown(type_: ConditionType, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_,
            status: ConditionStatus::Unknown,
            severity: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Same content ignoring the transition time
    fn same_content(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Condition set of one resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// Upsert a condition using the current time; returns whether anything changed
    pub fn set(&mut self, condition: Condition) -> bool {
        self.set_at(condition, Utc::now())
    }

    /// Upsert a condition as of `now`
    ///
    /// The stored transition time is kept when the status is unchanged and set to `now`
    /// when the status changes or the condition is new. Setting identical content is a
    /// no-op.
    pub fn set_at(&mut self, mut condition: Condition, now: DateTime<Utc>) -> bool {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.same_content(&condition) {
                    return false;
                }
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    now
                };
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = now;
                let pos = self
                    .0
                    .iter()
                    .position(|c| c.type_ > condition.type_)
                    .unwrap_or(self.0.len());
                self.0.insert(pos, condition);
                true
            }
        }
    }

    pub fn mark_true(&mut self, type_: ConditionType) -> bool {
        self.set(Condition::true_(type_))
    }

    pub fn mark_false(
        &mut self,
        type_: ConditionType,
        severity: Severity,
        reason: &str,
        message: impl Into<String>,
    ) -> bool {
        self.set(Condition::false_(type_, severity, reason, message))
    }

    pub fn mark_unknown(
        &mut self,
        type_: ConditionType,
        reason: &str,
        message: impl Into<String>,
    ) -> bool {
        self.set(Condition::unknown(type_, reason, message))
    }

    /// Remove a condition; returns whether it existed
    pub fn delete(&mut self, type_: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        before != self.0.len()
    }

    /// Aggregate the listed conditions into a `Ready` condition
    ///
    /// - False when any listed condition is False; the most severe one supplies
    ///   severity, reason and message, and among equals the first in `types` wins.
    /// - Otherwise Unknown when any listed condition is absent or Unknown; the first
    ///   such condition in `types` supplies the reason.
    /// - Otherwise True.
    ///
    /// The transition time of the result is assigned when it is stored with `set`.
    pub fn summarize(&self, types: &[ConditionType]) -> Condition {
        let mut worst: Option<&Condition> = None;
        for c in types.iter().filter_map(|t| self.get(*t)) {
            if c.status != ConditionStatus::False {
                continue;
            }
            let rank = c.severity.unwrap_or(Severity::Info);
            let replace = match worst {
                None => true,
                Some(w) => rank > w.severity.unwrap_or(Severity::Info),
            };
            if replace {
                worst = Some(c);
            }
        }

        if let Some(w) = worst {
            return Condition {
                type_: ConditionType::Ready,
                status: ConditionStatus::False,
                severity: Some(w.severity.unwrap_or(Severity::Info)),
                reason: w.reason.clone(),
                message: w.message.clone(),
                last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
            };
        }

        for t in types {
            match self.get(*t) {
                None => {
                    return Condition::unknown(
                        ConditionType::Ready,
                        reasons::PENDING,
                        format!("{t} has not been reported"),
                    );
                }
                Some(c) if c.status == ConditionStatus::Unknown => {
                    return Condition {
                        type_: ConditionType::Ready,
                        status: ConditionStatus::Unknown,
                        severity: None,
                        reason: Some(
                            c.reason
                                .clone()
                                .unwrap_or_else(|| reasons::PENDING.to_string()),
                        ),
                        message: c.message.clone(),
                        last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
                    };
                }
                Some(_) => {}
            }
        }

        Condition::true_(ConditionType::Ready)
    }

    /// Store the summary of `types` as the `Ready` condition
    pub fn set_summary(&mut self, types: &[ConditionType]) -> bool {
        let summary = self.summarize(types);
        self.set(summary)
    }
}
