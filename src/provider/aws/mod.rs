//! # AWS
//!
//! AWS SDK integration: controller credentials from the default credential chain and
//! STS role assumption for role identities.

pub mod auth;

pub use auth::AwsStsBackend;
