//! # Coalescing Cache
//!
//! Per-identity cooldown between convergence passes.
//!
//! For each key the cache keeps when it was last processed and the instant before which
//! another pass is refused. A request inside the window is skipped and told how long
//! remains; it is neither queued nor run. An allowed pass refreshes the window both when
//! it starts and when it finishes, whatever its outcome.

use crate::controller::reconciler::{ReconcileAction, ReconcileHandler, ReconcilerError};
use crate::model::ResourceKey;
use crate::observability;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_processed: Instant,
    not_before: Instant,
    generation: Option<i64>,
}

/// Thread-safe map of identity to cooldown window
#[derive(Debug)]
pub struct CoalescingCache {
    cooldown: Duration,
    bypass_on_generation_change: bool,
    entries: Mutex<HashMap<ResourceKey, Entry>>,
}

impl CoalescingCache {
    pub fn new(cooldown: Duration, bypass_on_generation_change: bool) -> Self {
        Self {
            cooldown,
            bypass_on_generation_change,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a pass now, or return the remaining cooldown
    ///
    /// Admission reserves the window atomically, so two concurrent callers for the same
    /// key cannot both be admitted. With generation bypass enabled a newer spec
    /// generation is admitted inside the window.
    pub fn should_process(
        &self,
        key: &ResourceKey,
        generation: Option<i64>,
    ) -> Result<(), Duration> {
        self.should_process_at(key, generation, Instant::now())
    }

    pub fn should_process_at(
        &self,
        key: &ResourceKey,
        generation: Option<i64>,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(key) {
            let newer_spec = self.bypass_on_generation_change
                && matches!((generation, entry.generation), (Some(g), Some(seen)) if g > seen);
            if now < entry.not_before && !newer_spec {
                return Err(entry.not_before - now);
            }
        }
        let generation = generation.or_else(|| entries.get(key).and_then(|e| e.generation));
        entries.insert(
            key.clone(),
            Entry {
                last_processed: now,
                not_before: now + self.cooldown,
                generation,
            },
        );
        Ok(())
    }

    /// Restart the window at `now`; called when an admitted pass finishes
    pub fn record(&self, key: &ResourceKey) {
        self.record_at(key, Instant::now());
    }

    pub fn record_at(&self, key: &ResourceKey, now: Instant) {
        let mut entries = self.entries();
        let generation = entries.get(key).and_then(|e| e.generation);
        entries.insert(
            key.clone(),
            Entry {
                last_processed: now,
                not_before: now + self.cooldown,
                generation,
            },
        );
    }

    pub fn last_processed(&self, key: &ResourceKey) -> Option<Instant> {
        self.entries().get(key).map(|e| e.last_processed)
    }

    pub fn forget(&self, key: &ResourceKey) {
        self.entries().remove(key);
    }
}

/// Wraps a handler with the coalescing cache
pub struct CoalescingReconciler {
    inner: Arc<dyn ReconcileHandler>,
    cache: Arc<CoalescingCache>,
}

impl CoalescingReconciler {
    pub fn new(inner: Arc<dyn ReconcileHandler>, cache: Arc<CoalescingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<CoalescingCache> {
        &self.cache
    }
}

#[async_trait]
impl ReconcileHandler for CoalescingReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError> {
        let generation = if self.cache.bypass_on_generation_change {
            self.inner.generation(key).await
        } else {
            None
        };
        if let Err(remaining) = self.cache.should_process(key, generation) {
            debug!(
                resource = %key,
                remaining_ms = remaining.as_millis() as u64,
                "Skipping reconcile inside coalescing window"
            );
            observability::metrics::increment_coalesced_requests();
            return Ok(ReconcileAction::Skipped(remaining));
        }

        let result = self.inner.reconcile(key).await;
        match &result {
            Ok(ReconcileAction::Removed) => self.cache.forget(key),
            _ => self.cache.record(key),
        }
        result
    }

    async fn generation(&self, key: &ResourceKey) -> Option<i64> {
        self.inner.generation(key).await
    }
}
