//! # Watch Loop
//!
//! Turns `AWSCluster` watch events into scheduler requests and keeps the watch alive.

use crate::controller::scheduler::Scheduler;
use crate::crd::AWSCluster;
use crate::model::ResourceKey;
use crate::runtime::error_policy::{handle_watch_stream_error, WatchErrorAction};
use crate::runtime::initialization::InitializationResult;
use anyhow::Result;
use futures::{pin_mut, StreamExt};
use kube::runtime::watcher;
use kube::Api;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const INITIAL_WATCH_BACKOFF_MS: u64 = 500;
const MAX_WATCH_BACKOFF_MS: u64 = 30_000;

fn key_of(obj: &AWSCluster) -> Option<ResourceKey> {
    Some(ResourceKey::new(
        obj.metadata.namespace.clone()?,
        obj.metadata.name.clone()?,
    ))
}

/// Run the scheduler and the watch until ctrl-c
pub async fn run_watch_loop(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        clusters,
        scheduler,
        server_state,
        ..
    } = init;

    let workers = tokio::spawn(Arc::clone(&scheduler).run());

    tokio::select! {
        () = watch_clusters(clusters, Arc::clone(&scheduler)) => {
            info!("Watch loop ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal, stopping controller");
        }
    }

    server_state.is_ready.store(false, Ordering::Relaxed);
    workers.abort();
    Ok(())
}

/// Watch `AWSCluster` objects, restarting the stream whenever it fails
async fn watch_clusters(clusters: Api<AWSCluster>, scheduler: Arc<Scheduler>) {
    let backoff_ms = AtomicU64::new(INITIAL_WATCH_BACKOFF_MS);

    loop {
        let stream = watcher(clusters.clone(), watcher::Config::default());
        pin_mut!(stream);
        info!("Watching AWSCluster resources");

        while let Some(event_result) = stream.next().await {
            match event_result {
                Ok(event) => {
                    backoff_ms.store(INITIAL_WATCH_BACKOFF_MS, Ordering::Relaxed);
                    match event {
                        watcher::Event::Apply(obj)
                        | watcher::Event::InitApply(obj)
                        | watcher::Event::Delete(obj) => {
                            if let Some(key) = key_of(&obj) {
                                debug!(resource = %key, "Watch event");
                                scheduler.enqueue(key);
                            }
                        }
                        watcher::Event::Init | watcher::Event::InitDone => {}
                    }
                }
                Err(e) => {
                    let action =
                        handle_watch_stream_error(&e.to_string(), &backoff_ms, MAX_WATCH_BACKOFF_MS)
                            .await;
                    if action == WatchErrorAction::Restart {
                        break;
                    }
                }
            }
        }
    }
}
