//! # Metrics Registry
//!
//! Prometheus metrics registry setup and registration.

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::LazyLock;

/// Global Prometheus metrics registry
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Register all metrics with the Prometheus registry
///
/// Prometheus Registry::register() takes ownership (Box<dyn Collector>),
/// so we clone the metrics. Cloning only bumps the inner Arc.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    super::controller_metrics::register_controller_metrics()?;
    Ok(())
}

/// Encode every registered metric in the Prometheus text format
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
