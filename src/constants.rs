//! # Constants
//!
//! Default values and well-known keys shared across the controller.

/// Finalizer guarding AWSCluster removal until owned infrastructure is gone
pub const CLUSTER_FINALIZER: &str = "awscluster.infrastructure.cluster.x-k8s.io";

/// Field manager used for status and metadata patches
pub const FIELD_MANAGER: &str = "cluster-infra-controller";

/// Annotation that pauses reconciliation of a resource
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation holding fields that a legacy API version cannot represent
pub const CONVERSION_DATA_ANNOTATION: &str = "infrastructure.cluster.x-k8s.io/conversion-data";

/// Name of the singleton controller identity
pub const DEFAULT_CONTROLLER_IDENTITY: &str = "default";

/// Default API server port exposed by the control plane load balancer
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Default concurrency limit for reconciliation workers
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 5;

/// Default coalescing cooldown between passes for one resource
pub const DEFAULT_COALESCING_COOLDOWN_SECS: u64 = 10;

/// Default delay before re-checking load balancer DNS
pub const DEFAULT_DNS_REQUEUE_INTERVAL_SECS: u64 = 15;

/// Default periodic resync interval for converged resources
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Default initial backoff after a failed pass
pub const DEFAULT_ERROR_BACKOFF_BASE_SECS: u64 = 1;

/// Default cap for backoff after repeated failures
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Namespace holding static identity secrets
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "capa-system";

/// HTTP port for metrics and probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Seconds to wait for the HTTP server to bind
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Poll interval while waiting for the HTTP server
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 100;

/// Delay before restarting a failed watch stream
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default CIDR for managed VPCs
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

/// Default bastion instance type
pub const DEFAULT_BASTION_INSTANCE_TYPE: &str = "t3.micro";

/// Default load balancer idle timeout
pub const DEFAULT_LB_IDLE_TIMEOUT_SECS: u32 = 60;

/// Maximum nesting of role identities resolved through `sourceIdentityRef`
pub const MAX_IDENTITY_CHAIN_DEPTH: usize = 5;

/// Default STS session duration for role identities
pub const DEFAULT_ROLE_SESSION_DURATION_SECS: i32 = 900;
