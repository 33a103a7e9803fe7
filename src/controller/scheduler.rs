//! # Reconcile Scheduler
//!
//! Work queue in front of the convergence engine.
//!
//! - A key is queued at most once. A key that arrives while its pass is running is
//!   marked dirty and queued again when that pass ends, so two passes for the same key
//!   never overlap.
//! - At most `max_concurrent` passes run at once across all keys.
//! - The outcome of a pass decides the next one: converged resources come back after
//!   the resync interval, waiting ones after the delay they asked for, skipped ones
//!   after the remaining cooldown, failed ones after exponential backoff. Terminal
//!   failures wait for the next change or the resync interval.
//! - A key has at most one armed requeue timer. When two requeues compete the earlier
//!   deadline wins. A pass cancels the armed timer; a skipped pass carries it over.

use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::reconciler::{ReconcileAction, ReconcileHandler};
use crate::model::ResourceKey;
use crate::observability;
use crate::runtime::error_policy;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scheduling status of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    WaitingExternal,
}

impl Phase {
    fn is_finished(self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::Failed | Phase::WaitingExternal
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "Idle",
            Phase::Scheduled => "Scheduled",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::WaitingExternal => "WaitingExternal",
        };
        f.write_str(s)
    }
}

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub resync_interval: Duration,
    /// How long a finished phase is reported before it reads as Idle
    pub cooldown: Duration,
    pub backoff: ExponentialBackoff,
}

impl From<&ControllerConfig> for SchedulerConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_reconciles.max(1),
            resync_interval: config.resync_interval,
            cooldown: config.coalescing_cooldown,
            backoff: ExponentialBackoff::new(
                config.error_backoff_base,
                config.error_backoff_max,
            ),
        }
    }
}

#[derive(Debug)]
struct KeyState {
    phase: Phase,
    queued: bool,
    running: bool,
    dirty: bool,
    failures: u32,
    finished_at: Option<Instant>,
    /// Bumped whenever a delayed requeue is armed or a pass starts; a timer only fires
    /// if it still holds the latest token
    timer_token: u64,
    /// When the armed timer fires
    deadline: Option<Instant>,
    passes: u64,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            queued: false,
            running: false,
            dirty: false,
            failures: 0,
            finished_at: None,
            timer_token: 0,
            deadline: None,
            passes: 0,
        }
    }
}

pub struct Scheduler {
    handler: Arc<dyn ReconcileHandler>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    states: Mutex<HashMap<ResourceKey, KeyState>>,
    tx: mpsc::UnboundedSender<ResourceKey>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ResourceKey>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(handler: Arc<dyn ReconcileHandler>, config: SchedulerConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handler,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            states: Mutex::new(HashMap::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn states(&self) -> MutexGuard<'_, HashMap<ResourceKey, KeyState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` for a pass as soon as a worker is free
    pub fn enqueue(&self, key: ResourceKey) {
        let mut states = self.states();
        let state = states.entry(key.clone()).or_default();
        if state.running {
            debug!(resource = %key, "Pass in flight, coalescing into the next one");
            state.dirty = true;
            return;
        }
        if state.queued {
            debug!(resource = %key, "Already queued");
            return;
        }
        state.queued = true;
        state.phase = Phase::Scheduled;
        if self.tx.send(key).is_err() {
            warn!("Scheduler queue closed");
        }
    }

    /// Queue `key` after `delay`
    ///
    /// Keeps an already armed timer that fires sooner.
    pub fn enqueue_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        let token = {
            let mut states = self.states();
            let state = states.entry(key.clone()).or_default();
            if state.deadline.is_some_and(|armed| armed <= deadline) {
                debug!(resource = %key, "Earlier requeue already armed");
                return;
            }
            state.timer_token += 1;
            state.deadline = Some(deadline);
            state.timer_token
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut states = scheduler.states();
                match states.get_mut(&key) {
                    Some(state) if state.timer_token == token => {
                        state.deadline = None;
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                scheduler.enqueue(key);
            }
        });
    }

    /// Phase of `key`; a finished phase reads as Idle once the cooldown elapsed
    pub fn phase(&self, key: &ResourceKey) -> Phase {
        let states = self.states();
        let Some(state) = states.get(key) else {
            return Phase::Idle;
        };
        match state.finished_at {
            Some(at) if state.phase.is_finished() && at + self.config.cooldown <= Instant::now() => {
                Phase::Idle
            }
            _ => state.phase,
        }
    }

    /// Number of passes the handler ran (or skipped) for `key`
    pub fn passes(&self, key: &ResourceKey) -> u64 {
        self.states().get(key).map_or(0, |s| s.passes)
    }

    /// Consecutive failures of `key`
    pub fn failures(&self, key: &ResourceKey) -> u32 {
        self.states().get(key).map_or(0, |s| s.failures)
    }

    /// Dispatch queued keys to workers until the queue closes
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.rx.lock().await;
        info!(
            max_concurrent = self.config.max_concurrent,
            "Reconcile scheduler started"
        );
        while let Some(key) = rx.recv().await {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.process(key).await;
                drop(permit);
            });
        }
    }

    async fn process(self: &Arc<Self>, key: ResourceKey) {
        let armed = {
            let mut states = self.states();
            let state = states.entry(key.clone()).or_default();
            state.queued = false;
            state.running = true;
            state.dirty = false;
            state.phase = Phase::Running;
            state.timer_token += 1;
            state.passes += 1;
            state.deadline.take()
        };

        let result = self.handler.reconcile(&key).await;

        let mut requeue: Option<(Duration, &'static str)> = None;
        let mut forget = false;
        {
            let mut states = self.states();
            let state = states.entry(key.clone()).or_default();
            match &result {
                Ok(ReconcileAction::Converged) => {
                    state.phase = Phase::Succeeded;
                    state.failures = 0;
                    requeue = Some((self.config.resync_interval, "resync"));
                }
                Ok(ReconcileAction::Waiting(delay)) => {
                    state.phase = Phase::WaitingExternal;
                    state.failures = 0;
                    requeue = Some((*delay, "waiting"));
                }
                Ok(ReconcileAction::Skipped(remaining)) => {
                    if !state.phase.is_finished() {
                        state.phase = Phase::Idle;
                    }
                    let delay = armed
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .map_or(*remaining, |carried| carried.min(*remaining));
                    requeue = Some((delay, "coalesced"));
                }
                Ok(ReconcileAction::Removed) => {
                    state.phase = Phase::Idle;
                    state.failures = 0;
                    forget = !state.dirty;
                }
                Err(e) => {
                    state.phase = Phase::Failed;
                    state.failures += 1;
                    let delay = error_policy::handle_reconciliation_error(
                        &key,
                        e,
                        state.failures,
                        &self.config.backoff,
                        self.config.resync_interval,
                    );
                    let reason = if e.is_terminal() { "resync" } else { "error-backoff" };
                    requeue = Some((delay, reason));
                }
            }
            if !matches!(result, Ok(ReconcileAction::Skipped(_))) {
                state.finished_at = Some(Instant::now());
            }
            state.running = false;
        }

        let dirty = {
            let mut states = self.states();
            let dirty = states.get(&key).is_some_and(|s| s.dirty);
            if forget {
                states.remove(&key);
            }
            dirty
        };

        if dirty {
            self.enqueue(key);
        } else if let Some((delay, reason)) = requeue {
            if reason != "resync" {
                observability::metrics::increment_requeues_total(reason);
            }
            self.enqueue_after(key, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::ReconcilerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        outcomes: Mutex<Vec<Result<ReconcileAction, &'static str>>>,
        passes: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        hold: Duration,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<ReconcileAction, &'static str>>, hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                passes: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                hold,
            })
        }
    }

    #[async_trait]
    impl ReconcileHandler for Scripted {
        async fn reconcile(&self, _key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            let next = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.is_empty() {
                    Ok(ReconcileAction::Converged)
                } else {
                    outcomes.remove(0)
                }
            };
            next.map_err(|m| ReconcilerError::InvalidSpec(m.to_string()))
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: 2,
            resync_interval: Duration::from_secs(600),
            cooldown: Duration::from_secs(10),
            backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_enqueue_runs_once() {
        let handler = Scripted::new(vec![], Duration::from_millis(10));
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.phase(&key("a")), Phase::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_while_running_is_coalesced_into_next_pass() {
        let handler = Scripted::new(vec![], Duration::from_secs(2));
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.phase(&key("a")), Phase::Running);
        scheduler.enqueue(key("a"));
        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handler.passes.load(Ordering::SeqCst), 2);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let handler = Scripted::new(vec![], Duration::from_secs(1));
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        for name in ["a", "b", "c", "d", "e"] {
            scheduler.enqueue(key(name));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handler.passes.load(Ordering::SeqCst), 5);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_outcome_requeues_after_its_delay() {
        let handler = Scripted::new(
            vec![Ok(ReconcileAction::Waiting(Duration::from_secs(15)))],
            Duration::ZERO,
        );
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.phase(&key("a")), Phase::WaitingExternal);
        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.failures(&key("a")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_waits_for_resync() {
        let handler = Scripted::new(vec![Err("bad spec")], Duration::ZERO);
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.phase(&key("a")), Phase::Failed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.phase(&key("a")), Phase::Idle);

        tokio::time::sleep(Duration::from_secs(480)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.phase(&key("a")), Phase::Succeeded);
        assert_eq!(scheduler.failures(&key("a")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_pass_keeps_earlier_waiting_requeue() {
        let handler = Scripted::new(
            vec![
                Ok(ReconcileAction::Waiting(Duration::from_secs(15))),
                Ok(ReconcileAction::Skipped(Duration::from_secs(10))),
            ],
            Duration::ZERO,
        );
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 2);

        // Waiting deadline at 15s, not 12s + 10s
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_requeue_does_not_replace_earlier_one() {
        let handler = Scripted::new(vec![], Duration::ZERO);
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue_after(key("a"), Duration::from_secs(5));
        scheduler.enqueue_after(key("a"), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_phase_reads_idle_after_cooldown() {
        let handler = Scripted::new(vec![], Duration::ZERO);
        let scheduler = Scheduler::new(handler.clone(), config());
        tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.phase(&key("a")), Phase::Succeeded);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.phase(&key("a")), Phase::Idle);
    }
}
