//! # Cluster Infrastructure Controller
//!
//! Kubernetes controller that converges `AWSCluster` resources toward their spec: VPC and
//! subnets, security groups, an optional bastion, and the API server load balancer with its
//! registered control plane instances. Deleting a cluster tears the same objects down in
//! reverse order before its finalizer is released.
//!
//! Configuration comes from environment variables; see the README for the full list.

use anyhow::Result;
use cluster_infra_controller::runtime::initialization::initialize;
use cluster_infra_controller::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(init).await
}
