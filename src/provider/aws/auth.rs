//! # AWS Authentication
//!
//! Handles AWS SDK configuration and credential resolution for cluster identities.

use crate::controller::identity::{AssumeRoleRequest, IdentityError, StsBackend};
use crate::provider::{CredentialSource, Credentials};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use tracing::info;

const PROVIDER_NAME: &str = "cluster-infra-controller";

/// Create AWS SDK config using the default credential chain
///
/// The chain covers environment variables, web identity tokens (IRSA), the shared
/// profile and instance metadata.
pub async fn create_default_config(region: Option<&str>) -> SdkConfig {
    let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        builder = builder.region(aws_config::Region::new(region.to_string()));
    }
    builder.load().await
}

/// STS backend talking to AWS
#[derive(Debug, Clone, Default)]
pub struct AwsStsBackend {
    region: Option<String>,
}

impl AwsStsBackend {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }
}

#[async_trait]
impl StsBackend for AwsStsBackend {
    async fn controller_credentials(&self) -> Result<Credentials, IdentityError> {
        let config = create_default_config(self.region.as_deref()).await;
        let provider = config.credentials_provider().ok_or_else(|| {
            IdentityError::ControllerCredentials("no credential provider configured".to_string())
        })?;
        let creds = provider
            .provide_credentials()
            .await
            .map_err(|e| IdentityError::ControllerCredentials(e.to_string()))?;
        Ok(Credentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
            source: CredentialSource::Controller,
        })
    }

    async fn assume_role(
        &self,
        source: &Credentials,
        request: &AssumeRoleRequest,
    ) -> Result<Credentials, IdentityError> {
        info!(
            role_arn = %request.role_arn,
            session_name = %request.session_name,
            "Assuming role"
        );
        let base = create_default_config(self.region.as_deref()).await;
        let source_creds = aws_credential_types::Credentials::new(
            source.access_key_id.clone(),
            source.secret_access_key.clone(),
            source.session_token.clone(),
            None,
            PROVIDER_NAME,
        );
        let sts_config = aws_sdk_sts::config::Builder::from(&base)
            .credentials_provider(SharedCredentialsProvider::new(source_creds))
            .build();
        let client = aws_sdk_sts::Client::from_conf(sts_config);

        let assume_error = |message: String| IdentityError::AssumeRole {
            role_arn: request.role_arn.clone(),
            message,
        };

        let response = client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .set_external_id(request.external_id.clone())
            .set_policy(request.inline_policy.clone())
            .duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|e| assume_error(e.to_string()))?;

        let creds = response
            .credentials()
            .ok_or_else(|| assume_error("STS returned no credentials".to_string()))?;

        Ok(Credentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: Some(creds.session_token().to_string()),
            source: CredentialSource::AssumedRole {
                role_arn: request.role_arn.clone(),
            },
        })
    }
}
