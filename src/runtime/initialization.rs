//! # Initialization
//!
//! Controller startup: rustls, tracing, metrics, the probe server, the Kubernetes client,
//! and the reconciler stack behind the scheduler.

use crate::config::{load_config, ControllerConfig, ServerConfig};
use crate::controller::coalescing::{CoalescingCache, CoalescingReconciler};
use crate::controller::events::KubeEventSink;
use crate::controller::identity::{IdentityResolver, KubeIdentitySource};
use crate::controller::reconciler::Reconciler;
use crate::controller::scheduler::{Scheduler, SchedulerConfig};
use crate::controller::server::{start_server, ServerState};
use crate::crd::AWSCluster;
use crate::provider::aws::AwsStsBackend;
use crate::provider::memory::MemoryCloud;
use crate::store::{KubeStore, ResourceStore};
use crate::{constants, observability};
use anyhow::{Context, Result};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    /// `AWSCluster` API, namespaced when `WATCH_NAMESPACE` is set
    pub clusters: Api<AWSCluster>,
    pub scheduler: Arc<Scheduler>,
    pub server_state: Arc<ServerState>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_infra_controller=info".into()),
        )
        .init();

    info!("Starting Cluster Infrastructure Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let (config, server_config) = load_config();
    info!(?config, "Loaded controller configuration");

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    });
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let clusters: Api<AWSCluster> = match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(
        client.clone(),
        config.watch_namespace.clone(),
    ));
    let identities = IdentityResolver::new(
        Arc::new(KubeIdentitySource::new(
            client.clone(),
            config.controller_namespace.clone(),
        )),
        Arc::new(AwsStsBackend::new(None)),
    );

    // No EC2/ELB adapters ship with this crate. The in-memory provider keeps the engine
    // runnable end to end and answers DNS for its own load balancers.
    warn!("Using the in-memory sub-resource provider; no cloud objects will be created");
    let cloud = MemoryCloud::with_instant_dns();

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::new(identities),
        Arc::new(cloud.clone()),
        Arc::new(cloud),
        Arc::new(KubeEventSink::new(client.clone(), constants::FIELD_MANAGER)),
        config.clone(),
    ));
    let cache = Arc::new(CoalescingCache::new(
        config.coalescing_cooldown,
        config.coalescing_bypass_on_generation_change,
    ));
    let handler = Arc::new(CoalescingReconciler::new(reconciler, cache));
    let scheduler = Scheduler::new(handler, SchedulerConfig::from(&config));

    enqueue_existing_resources(store.as_ref(), &scheduler).await;

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        clusters,
        scheduler,
        server_state,
        config,
    })
}

/// Wait for the HTTP server to bind
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = std::time::Duration::from_secs(server_config.startup_timeout_secs);
    let poll_interval = std::time::Duration::from_millis(server_config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Queue every existing cluster before the watch starts
async fn enqueue_existing_resources(store: &dyn ResourceStore, scheduler: &Arc<Scheduler>) {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.reconcile_existing",
        operation = "enqueue_existing_resources"
    );
    let _guard = span.enter();

    let keys = match store.list().await {
        Ok(keys) => keys,
        Err(e) => {
            error!("AWSCluster CRD is not queryable: {}. Is the CRD installed?", e);
            warn!("Continuing; the watch will pick resources up once the CRD is available");
            return;
        }
    };

    if keys.is_empty() {
        info!("No existing AWSCluster resources found, watch will pick up new resources");
        return;
    }

    let mut by_namespace: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for key in &keys {
        by_namespace
            .entry(key.namespace.as_str())
            .or_default()
            .push(key.name.as_str());
    }
    info!(
        "Startup resource summary: {} AWSCluster resources in {} namespaces",
        keys.len(),
        by_namespace.len()
    );
    for (namespace, names) in &by_namespace {
        info!("  {}: {}", namespace, names.join(", "));
    }

    for key in keys {
        scheduler.enqueue(key);
    }
}
