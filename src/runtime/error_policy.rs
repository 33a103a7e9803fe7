//! # Error Policy
//!
//! What happens after a failed pass, and how watch stream errors are classified.

use crate::constants;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::reconciler::ReconcilerError;
use crate::model::ResourceKey;
use crate::observability;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Decide when to retry a failed pass
///
/// Retryable failures get the backoff delay. Terminal ones wait for the next spec change
/// or for `resync`, whichever comes first; identities are not watched, so the resync is
/// what picks up one created after the cluster.
pub fn handle_reconciliation_error(
    key: &ResourceKey,
    error: &ReconcilerError,
    failures: u32,
    backoff: &ExponentialBackoff,
    resync: Duration,
) -> Duration {
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        error.kind = error.kind(),
        error = %error
    );
    let _error_guard = error_span.enter();

    observability::metrics::increment_reconciliation_errors();

    if error.is_terminal() {
        error!(
            "Reconciliation of {} failed permanently: {}; waiting for a spec change or resync in {:?}",
            key, error, resync
        );
        return resync;
    }

    let delay = backoff.delay(failures);
    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    warn!("Reconciliation error for {}: {}", key, error);
    info!(
        "Retrying in {:?} (failure count: {}, next attempt at {}, trigger source: error-backoff)",
        delay,
        failures,
        next_trigger_time.to_rfc3339()
    );
    delay
}

/// How the watch loop should react to a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorAction {
    /// Keep consuming the stream
    Continue,
    /// Tear the stream down and start a new watch
    Restart,
}

/// Classify a watch stream error, sleeping where the error calls for it
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff_ms: &AtomicU64,
    max_backoff_ms: u64,
) -> WatchErrorAction {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    let is_401 = error_string.contains("401")
        || error_string.contains("Unauthorized")
        || error_string.contains("WatchFailed");
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");
    let is_not_found = error_string.contains("ObjectNotFound")
        || (error_string.contains("404") && error_string.contains("not found"));

    if is_401 {
        error!("Watch authentication failed (401 Unauthorized); RBAC may have been revoked or the token expired");
        error!("Diagnostics:");
        error!("   1. kubectl get clusterrole cluster-infra-controller");
        error!("   2. kubectl get clusterrolebinding cluster-infra-controller -o yaml");
        error!("   3. kubectl auth can-i watch awsclusters.infrastructure.cluster.x-k8s.io --as=system:serviceaccount:capa-system:cluster-infra-controller --all-namespaces");
        warn!(
            "Waiting {}s before restarting the watch",
            constants::DEFAULT_WATCH_RESTART_DELAY_SECS
        );
        tokio::time::sleep(Duration::from_secs(
            constants::DEFAULT_WATCH_RESTART_DELAY_SECS,
        ))
        .await;
        WatchErrorAction::Restart
    } else if is_410 {
        warn!(error_type = "410", "Watch resource version expired, restarting watch");
        WatchErrorAction::Restart
    } else if is_429 {
        let current = backoff_ms.load(Ordering::Relaxed);
        warn!(
            "API server storage reinitializing (429), backing off for {}ms before restart",
            current
        );
        tokio::time::sleep(Duration::from_millis(current)).await;
        backoff_ms.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
        WatchErrorAction::Restart
    } else if is_not_found {
        warn!("Resource not found (likely deleted), continuing watch");
        WatchErrorAction::Continue
    } else {
        error!("Controller stream error: {}", error_string);
        tokio::time::sleep(Duration::from_secs(
            constants::DEFAULT_WATCH_RESTART_DELAY_SECS,
        ))
        .await;
        WatchErrorAction::Restart
    }
}
