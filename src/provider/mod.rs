//! # Provider
//!
//! Sub-resource service layer consumed by the convergence engine.
//!
//! Every sub-resource kind is reached through a [`ResourceService`]: describe, create,
//! update, delete and list-by-owner. Implementations must be safe to retry. "Not found"
//! is reported as [`ProviderError::NotFound`] so that teardown can treat it as success.

pub mod aws;
pub mod dns;
pub mod memory;

use crate::model::attachment::InstanceAttachment;
use crate::model::bastion::Bastion;
use crate::model::load_balancer::LoadBalancer;
use crate::model::network::Network;
use crate::model::security_group::SecurityGroup;
use crate::model::SubResource;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use dns::{DnsResolver, SystemDnsResolver};

/// Errors returned by a sub-resource service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Request rate exceeded (retryable)
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Network failure or provider-side 5xx (retryable)
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Object exists in a state that conflicts with the request (retryable; usually
    /// eventual consistency)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request can never succeed as given (terminal)
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Unclassified provider error (retryable)
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ProviderError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderError::Invalid(_))
    }

    /// Short label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderError::NotFound { .. } => "not_found",
            ProviderError::Throttled(_) => "throttled",
            ProviderError::Transient(_) => "transient",
            ProviderError::Conflict(_) => "conflict",
            ProviderError::Invalid(_) => "invalid",
            ProviderError::Other(_) => "other",
        }
    }
}

/// Describe/create/update/delete contract for one sub-resource kind
#[async_trait]
pub trait ResourceService<R: SubResource>: Send + Sync {
    async fn describe(&self, name: &str) -> Result<R::Observed, ProviderError>;

    async fn create(&self, desired: &R::Desired) -> Result<R::Observed, ProviderError>;

    async fn update(&self, name: &str, diff: &R::Diff) -> Result<R::Observed, ProviderError>;

    async fn delete(&self, name: &str) -> Result<(), ProviderError>;

    /// Names of every object tagged `owner_tag_key=owned`
    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError>;
}

/// Provider credentials
///
/// Secret material is wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    #[zeroize(skip)]
    pub source: CredentialSource,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .finish()
    }
}

/// How a set of credentials was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Controller,
    AssumedRole { role_arn: String },
    Static { secret: String },
}

/// Services for every sub-resource kind, bound to one set of credentials and region
#[derive(Clone)]
pub struct CloudServices {
    pub networks: Arc<dyn ResourceService<Network>>,
    pub security_groups: Arc<dyn ResourceService<SecurityGroup>>,
    pub bastions: Arc<dyn ResourceService<Bastion>>,
    pub load_balancers: Arc<dyn ResourceService<LoadBalancer>>,
    pub attachments: Arc<dyn ResourceService<InstanceAttachment>>,
}

impl fmt::Debug for CloudServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudServices").finish_non_exhaustive()
    }
}

/// Builds the service layer for a resolved identity
pub trait ServiceFactory: Send + Sync {
    fn services(&self, credentials: &Credentials, region: &str) -> CloudServices;
}
