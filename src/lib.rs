//! Cluster Infrastructure Controller Library
//!
//! Convergence engine for `AWSCluster` resources: the resource graph model, condition
//! tracking, ordered ensure steps, the deletion sequencer and the reconcile scheduler.
//! Tests are included in the module files and under `tests/`.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod model;
pub mod observability;
pub mod provider;
pub mod runtime;
pub mod store;

// Re-export CRD types for convenience
pub use crd::*;
