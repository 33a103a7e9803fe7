//! # DNS Resolution
//!
//! Checks whether a load balancer's published DNS name resolves yet.

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// True once `host` resolves to at least one address
    async fn resolves(&self, host: &str) -> bool;
}

/// Resolver backed by the system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn resolves(&self, host: &str) -> bool {
        match tokio::net::lookup_host((host, 443)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(host = host, error = %e, "DNS lookup failed");
                false
            }
        }
    }
}
