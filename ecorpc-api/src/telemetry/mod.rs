//! ecorpc Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and Prometheus metrics for cached
//! RPC calls. Metrics register themselves in the default registry on first
//! use.

pub mod metrics;
pub mod middleware;
pub mod tracer;

use thiserror::Error;

pub use metrics::{render_metrics, RpcMetrics, METRICS};
pub use middleware::{Telemetry, TelemetryLayer};
pub use tracer::{init_tracing, LogFormat, TelemetryConfig};

/// Failures while setting up or exporting telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to init subscriber: {0}")]
    Subscriber(String),

    #[error("Failed to register metric {name}: {reason}")]
    Register { name: &'static str, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}
