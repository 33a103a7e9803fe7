//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup and registration
//! - `controller_metrics` - Reconciliation, requeue, coalescing and teardown metrics

pub mod controller_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use registry::*;
