//! # Controller
//!
//! Convergence engine, scheduling and the supporting pieces they share.
//!
//! - `reconciler` - One pass over a single cluster (normal and deletion paths)
//! - `conditions` - Per-step conditions and the Ready summary
//! - `identity` - Credential resolution through identity chains
//! - `coalescing` - Per-identity cooldown in front of the reconciler
//! - `scheduler` - Deduplicating work queue with bounded workers
//! - `events` - Kubernetes events for externally visible transitions
//! - `backoff` - Retry delays after failed passes
//! - `server` - Metrics and health probes

pub mod backoff;
pub mod coalescing;
pub mod conditions;
pub mod events;
pub mod identity;
pub mod reconciler;
pub mod scheduler;
pub mod server;
