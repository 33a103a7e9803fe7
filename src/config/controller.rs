//! # Reconciliation Configuration
//!
//! Scheduler, coalescing and requeue tunables loaded from environment variables.
//! Durations accept Kubernetes duration strings (`15s`, `10m`, `1h`).

use super::env_var_or_default;
use crate::controller::reconciler::validation::parse_kubernetes_duration;
use std::time::Duration;
use tracing::warn;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on concurrently running passes across all identities
    pub max_concurrent_reconciles: usize,
    /// Minimum spacing between two passes for the same identity
    pub coalescing_cooldown: Duration,
    /// Let a newer spec generation bypass the cooldown
    pub coalescing_bypass_on_generation_change: bool,
    /// Delay before re-checking a load balancer whose DNS is not ready
    pub dns_requeue_interval: Duration,
    /// Periodic resync for converged resources
    pub resync_interval: Duration,
    /// First backoff after a failed pass
    pub error_backoff_base: Duration,
    /// Backoff cap
    pub error_backoff_max: Duration,
    /// Port published as the control plane endpoint
    pub api_server_port: u16,
    /// Namespace holding static identity secrets
    pub controller_namespace: String,
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            coalescing_cooldown: Duration::from_secs(DEFAULT_COALESCING_COOLDOWN_SECS),
            coalescing_bypass_on_generation_change: false,
            dns_requeue_interval: Duration::from_secs(DEFAULT_DNS_REQUEUE_INTERVAL_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            error_backoff_base: Duration::from_secs(DEFAULT_ERROR_BACKOFF_BASE_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
            api_server_port: DEFAULT_API_SERVER_PORT,
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        let defaults = Self::default();
        Self {
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            )
            .max(1),
            coalescing_cooldown: duration_var_or_default(
                "COALESCING_COOLDOWN",
                defaults.coalescing_cooldown,
            ),
            coalescing_bypass_on_generation_change: env_var_or_default(
                "COALESCING_BYPASS_ON_GENERATION_CHANGE",
                false,
            ),
            dns_requeue_interval: duration_var_or_default(
                "DNS_REQUEUE_INTERVAL",
                defaults.dns_requeue_interval,
            ),
            resync_interval: duration_var_or_default("RESYNC_INTERVAL", defaults.resync_interval),
            error_backoff_base: duration_var_or_default(
                "ERROR_BACKOFF_BASE",
                defaults.error_backoff_base,
            ),
            error_backoff_max: duration_var_or_default(
                "ERROR_BACKOFF_MAX",
                defaults.error_backoff_max,
            ),
            api_server_port: env_var_or_default("API_SERVER_PORT", DEFAULT_API_SERVER_PORT),
            controller_namespace: std::env::var("CONTROLLER_NAMESPACE")
                .unwrap_or(defaults.controller_namespace),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.trim().is_empty()),
        }
    }
}

/// Read a duration variable, falling back to the default when unset or malformed
fn duration_var_or_default(key: &str, default: Duration) -> Duration {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match parse_kubernetes_duration(&raw) {
        Ok(d) => d,
        Err(e) => {
            warn!("Invalid {}='{}': {}, using default {:?}", key, raw, e, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.max_concurrent_reconciles, 5);
        assert_eq!(config.coalescing_cooldown, Duration::from_secs(10));
        assert_eq!(config.dns_requeue_interval, Duration::from_secs(15));
        assert_eq!(config.resync_interval, Duration::from_secs(600));
        assert_eq!(config.api_server_port, 6443);
        assert!(!config.coalescing_bypass_on_generation_change);
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn test_duration_var_falls_back_when_unset() {
        let d = duration_var_or_default(
            "CLUSTER_INFRA_TEST_UNSET_DURATION",
            Duration::from_secs(42),
        );
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn test_duration_var_falls_back_on_overflow() {
        let key = "CLUSTER_INFRA_TEST_OVERFLOW_DURATION";
        std::env::set_var(key, "999999999999999999d");
        let d = duration_var_or_default(key, Duration::from_secs(15));
        std::env::remove_var(key);
        assert_eq!(d, Duration::from_secs(15));
    }
}
