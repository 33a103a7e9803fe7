//! # Identity Resolution
//!
//! Turns an [`IdentityReference`] into provider credentials before any step runs.
//!
//! - Controller identity: the controller's own credential chain.
//! - Static identity: keys from a Secret in the controller namespace.
//! - Role identity: STS assume-role using the credentials of its source identity, or
//!   the controller's credentials when no source is given. Chains are limited to
//!   [`MAX_IDENTITY_CHAIN_DEPTH`] levels.
//!
//! Every identity in a chain must permit the cluster's namespace.

use crate::constants::{DEFAULT_ROLE_SESSION_DURATION_SECS, MAX_IDENTITY_CHAIN_DEPTH};
use crate::crd::{
    namespace_allowed, AWSClusterControllerIdentity, AWSClusterRoleIdentity,
    AWSClusterStaticIdentity, AllowedNamespaces, AwsClusterControllerIdentitySpec,
    AwsClusterRoleIdentitySpec, AwsClusterStaticIdentitySpec, IdentityKind, IdentityReference,
};
use crate::provider::{CredentialSource, Credentials};
use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret keys holding static credentials
pub const SECRET_ACCESS_KEY_ID: &str = "AccessKeyID";
pub const SECRET_SECRET_ACCESS_KEY: &str = "SecretAccessKey";
pub const SECRET_SESSION_TOKEN: &str = "SessionToken";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity {0} not found")]
    NotFound(IdentityReference),

    #[error("namespace '{namespace}' is not permitted to use identity {reference}")]
    NamespaceNotPermitted {
        reference: IdentityReference,
        namespace: String,
    },

    #[error("identity chain exceeds {MAX_IDENTITY_CHAIN_DEPTH} levels at {0}")]
    ChainTooDeep(IdentityReference),

    #[error("credentials secret '{0}' is missing or incomplete")]
    InvalidSecret(String),

    #[error("failed to assume role {role_arn}: {message}")]
    AssumeRole { role_arn: String, message: String },

    #[error("controller credentials unavailable: {0}")]
    ControllerCredentials(String),

    #[error("identity lookup failed: {0}")]
    Lookup(String),
}

impl IdentityError {
    /// The identity exists but the namespace may not use it
    pub fn is_usage_denied(&self) -> bool {
        matches!(self, IdentityError::NamespaceNotPermitted { .. })
    }

    /// Lookup and STS failures may clear up on their own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::AssumeRole { .. }
                | IdentityError::ControllerCredentials(_)
                | IdentityError::Lookup(_)
        )
    }
}

/// Static credentials as read from a Secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticSecret {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecret")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Parameters of an STS assume-role call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_seconds: i32,
    pub inline_policy: Option<String>,
}

/// Where identity objects and static secrets are read from
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn controller_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterControllerIdentitySpec>, IdentityError>;

    async fn role_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterRoleIdentitySpec>, IdentityError>;

    async fn static_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterStaticIdentitySpec>, IdentityError>;

    async fn static_secret(&self, name: &str) -> Result<Option<StaticSecret>, IdentityError>;
}

/// Base credentials and role assumption
#[async_trait]
pub trait StsBackend: Send + Sync {
    async fn controller_credentials(&self) -> Result<Credentials, IdentityError>;

    async fn assume_role(
        &self,
        source: &Credentials,
        request: &AssumeRoleRequest,
    ) -> Result<Credentials, IdentityError>;
}

/// Resolves an identity reference for a cluster namespace
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        reference: &IdentityReference,
        namespace: &str,
    ) -> Result<Credentials, IdentityError>;
}

/// Resolver over an [`IdentitySource`] and an [`StsBackend`]
#[derive(Clone)]
pub struct IdentityResolver {
    source: Arc<dyn IdentitySource>,
    sts: Arc<dyn StsBackend>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(source: Arc<dyn IdentitySource>, sts: Arc<dyn StsBackend>) -> Self {
        Self { source, sts }
    }

    fn check_namespace(
        reference: &IdentityReference,
        allowed: Option<&AllowedNamespaces>,
        namespace: &str,
    ) -> Result<(), IdentityError> {
        if namespace_allowed(allowed, namespace) {
            Ok(())
        } else {
            Err(IdentityError::NamespaceNotPermitted {
                reference: reference.clone(),
                namespace: namespace.to_string(),
            })
        }
    }

    fn resolve_at_depth<'a>(
        &'a self,
        reference: &'a IdentityReference,
        namespace: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<Credentials, IdentityError>> {
        Box::pin(async move {
            if depth > MAX_IDENTITY_CHAIN_DEPTH {
                return Err(IdentityError::ChainTooDeep(reference.clone()));
            }
            debug!(identity = %reference, depth = depth, "Resolving identity");

            match reference.kind {
                IdentityKind::Controller => {
                    let spec = self
                        .source
                        .controller_identity(&reference.name)
                        .await?
                        .ok_or_else(|| IdentityError::NotFound(reference.clone()))?;
                    Self::check_namespace(reference, spec.allowed_namespaces.as_ref(), namespace)?;
                    self.sts.controller_credentials().await
                }
                IdentityKind::Static => {
                    let spec = self
                        .source
                        .static_identity(&reference.name)
                        .await?
                        .ok_or_else(|| IdentityError::NotFound(reference.clone()))?;
                    Self::check_namespace(reference, spec.allowed_namespaces.as_ref(), namespace)?;
                    let secret = self
                        .source
                        .static_secret(&spec.secret_ref)
                        .await?
                        .ok_or_else(|| IdentityError::InvalidSecret(spec.secret_ref.clone()))?;
                    Ok(Credentials {
                        access_key_id: secret.access_key_id.clone(),
                        secret_access_key: secret.secret_access_key.clone(),
                        session_token: secret.session_token.clone(),
                        source: CredentialSource::Static {
                            secret: spec.secret_ref.clone(),
                        },
                    })
                }
                IdentityKind::Role => {
                    let spec = self
                        .source
                        .role_identity(&reference.name)
                        .await?
                        .ok_or_else(|| IdentityError::NotFound(reference.clone()))?;
                    Self::check_namespace(reference, spec.allowed_namespaces.as_ref(), namespace)?;
                    let source_credentials = match &spec.source_identity_ref {
                        Some(source_ref) => {
                            self.resolve_at_depth(source_ref, namespace, depth + 1)
                                .await?
                        }
                        None => self.sts.controller_credentials().await?,
                    };
                    let request = AssumeRoleRequest {
                        role_arn: spec.role_arn.clone(),
                        session_name: spec
                            .session_name
                            .clone()
                            .unwrap_or_else(|| format!("{namespace}-{}", reference.name)),
                        external_id: spec.external_id.clone(),
                        duration_seconds: spec
                            .duration_seconds
                            .unwrap_or(DEFAULT_ROLE_SESSION_DURATION_SECS),
                        inline_policy: spec.inline_policy.clone(),
                    };
                    self.sts.assume_role(&source_credentials, &request).await
                }
            }
        })
    }
}

#[async_trait]
impl CredentialResolver for IdentityResolver {
    async fn resolve(
        &self,
        reference: &IdentityReference,
        namespace: &str,
    ) -> Result<Credentials, IdentityError> {
        let credentials = self.resolve_at_depth(reference, namespace, 1).await?;
        info!(identity = %reference, namespace = namespace, "Resolved identity");
        Ok(credentials)
    }
}

/// Identity objects held in memory
///
/// Clones share the same objects, so a test can add identities after handing the
/// source to a resolver.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentitySource {
    objects: Arc<Mutex<IdentityObjects>>,
}

#[derive(Debug, Default)]
struct IdentityObjects {
    controllers: HashMap<String, AwsClusterControllerIdentitySpec>,
    roles: HashMap<String, AwsClusterRoleIdentitySpec>,
    statics: HashMap<String, AwsClusterStaticIdentitySpec>,
    secrets: HashMap<String, StaticSecret>,
}

impl MemoryIdentitySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose `default` controller identity admits every namespace
    pub fn allow_all_controller() -> Self {
        let mut source = Self::new();
        source.add_controller(
            crate::constants::DEFAULT_CONTROLLER_IDENTITY,
            AwsClusterControllerIdentitySpec {
                allowed_namespaces: Some(AllowedNamespaces::default()),
            },
        );
        source
    }

    fn objects(&self) -> MutexGuard<'_, IdentityObjects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_controller(&mut self, name: &str, spec: AwsClusterControllerIdentitySpec) {
        self.objects().controllers.insert(name.to_string(), spec);
    }

    pub fn add_role(&mut self, name: &str, spec: AwsClusterRoleIdentitySpec) {
        self.objects().roles.insert(name.to_string(), spec);
    }

    pub fn add_static(&mut self, name: &str, spec: AwsClusterStaticIdentitySpec) {
        self.objects().statics.insert(name.to_string(), spec);
    }

    pub fn add_secret(&mut self, name: &str, secret: StaticSecret) {
        self.objects().secrets.insert(name.to_string(), secret);
    }
}

#[async_trait]
impl IdentitySource for MemoryIdentitySource {
    async fn controller_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterControllerIdentitySpec>, IdentityError> {
        Ok(self.objects().controllers.get(name).cloned())
    }

    async fn role_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterRoleIdentitySpec>, IdentityError> {
        Ok(self.objects().roles.get(name).cloned())
    }

    async fn static_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterStaticIdentitySpec>, IdentityError> {
        Ok(self.objects().statics.get(name).cloned())
    }

    async fn static_secret(&self, name: &str) -> Result<Option<StaticSecret>, IdentityError> {
        Ok(self.objects().secrets.get(name).cloned())
    }
}

/// Identity objects and secrets read from the Kubernetes API
#[derive(Clone)]
pub struct KubeIdentitySource {
    client: Client,
    controller_namespace: String,
}

impl std::fmt::Debug for KubeIdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIdentitySource")
            .field("controller_namespace", &self.controller_namespace)
            .finish_non_exhaustive()
    }
}

impl KubeIdentitySource {
    pub fn new(client: Client, controller_namespace: impl Into<String>) -> Self {
        Self {
            client,
            controller_namespace: controller_namespace.into(),
        }
    }
}

fn lookup_error(e: &kube::Error) -> IdentityError {
    IdentityError::Lookup(e.to_string())
}

#[async_trait]
impl IdentitySource for KubeIdentitySource {
    async fn controller_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterControllerIdentitySpec>, IdentityError> {
        let api: Api<AWSClusterControllerIdentity> = Api::all(self.client.clone());
        let obj = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
        Ok(obj.map(|o| o.spec))
    }

    async fn role_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterRoleIdentitySpec>, IdentityError> {
        let api: Api<AWSClusterRoleIdentity> = Api::all(self.client.clone());
        let obj = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
        Ok(obj.map(|o| o.spec))
    }

    async fn static_identity(
        &self,
        name: &str,
    ) -> Result<Option<AwsClusterStaticIdentitySpec>, IdentityError> {
        let api: Api<AWSClusterStaticIdentity> = Api::all(self.client.clone());
        let obj = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
        Ok(obj.map(|o| o.spec))
    }

    async fn static_secret(&self, name: &str) -> Result<Option<StaticSecret>, IdentityError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.controller_namespace);
        let Some(secret) = api.get_opt(name).await.map_err(|e| lookup_error(&e))? else {
            return Ok(None);
        };
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .filter(|s| !s.is_empty())
        };
        let (Some(access_key_id), Some(secret_access_key)) =
            (field(SECRET_ACCESS_KEY_ID), field(SECRET_SECRET_ACCESS_KEY))
        else {
            return Err(IdentityError::InvalidSecret(name.to_string()));
        };
        Ok(Some(StaticSecret {
            access_key_id,
            secret_access_key,
            session_token: field(SECRET_SESSION_TOKEN),
        }))
    }
}

/// STS double that hands out synthetic credentials and records every request
#[derive(Debug, Clone, Default)]
pub struct StaticStsBackend {
    requests: Arc<Mutex<Vec<(CredentialSource, AssumeRoleRequest)>>>,
    deny_roles: Arc<Mutex<Vec<String>>>,
}

impl StaticStsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make assume-role calls for `role_arn` fail
    pub fn deny_role(&self, role_arn: &str) {
        self.deny_roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(role_arn.to_string());
    }

    /// (source credential kind, request) for every assume-role call
    pub fn requests(&self) -> Vec<(CredentialSource, AssumeRoleRequest)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StsBackend for StaticStsBackend {
    async fn controller_credentials(&self) -> Result<Credentials, IdentityError> {
        Ok(Credentials {
            access_key_id: "controller".to_string(),
            secret_access_key: "controller-secret".to_string(),
            session_token: None,
            source: CredentialSource::Controller,
        })
    }

    async fn assume_role(
        &self,
        source: &Credentials,
        request: &AssumeRoleRequest,
    ) -> Result<Credentials, IdentityError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((source.source.clone(), request.clone()));
        let denied = self
            .deny_roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&request.role_arn);
        if denied {
            return Err(IdentityError::AssumeRole {
                role_arn: request.role_arn.clone(),
                message: "AccessDenied".to_string(),
            });
        }
        Ok(Credentials {
            access_key_id: format!("assumed-{}", request.session_name),
            secret_access_key: "assumed-secret".to_string(),
            session_token: Some("session".to_string()),
            source: CredentialSource::AssumedRole {
                role_arn: request.role_arn.clone(),
            },
        })
    }
}
