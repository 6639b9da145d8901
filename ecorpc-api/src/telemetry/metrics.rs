//! Prometheus Metrics Definitions

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use super::TelemetryError;

/// RPC latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const RPC_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<Result<RpcMetrics, TelemetryError>> = Lazy::new(RpcMetrics::new);

/// Container for all ecorpc metrics.
#[derive(Clone)]
pub struct RpcMetrics {
    /// Cache lookups - labels: method, result (hit|leader|coalesced|bypass|error)
    pub cache_lookups_total: CounterVec,

    /// Time a leader waited for its execution - labels: method
    pub cache_compute_seconds: HistogramVec,

    /// Executions currently in flight
    pub cache_in_flight: Gauge,

    /// Completed RPCs - labels: method, code
    pub rpc_requests_total: CounterVec,

    /// RPC duration histogram - labels: method
    pub rpc_request_duration_seconds: HistogramVec,
}

fn registration(name: &'static str) -> impl FnOnce(prometheus::Error) -> TelemetryError {
    move |e| TelemetryError::Register {
        name,
        reason: e.to_string(),
    }
}

impl RpcMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> Result<Self, TelemetryError> {
        Ok(Self {
            cache_lookups_total: register_counter_vec!(
                "ecorpc_cache_lookups_total",
                "Total number of cache lookups by result",
                &["method", "result"]
            )
            .map_err(registration("ecorpc_cache_lookups_total"))?,

            cache_compute_seconds: register_histogram_vec!(
                "ecorpc_cache_compute_seconds",
                "Duration of cache misses served by a fresh execution",
                &["method"],
                RPC_LATENCY_BUCKETS.to_vec()
            )
            .map_err(registration("ecorpc_cache_compute_seconds"))?,

            cache_in_flight: register_gauge!(
                "ecorpc_cache_in_flight",
                "Cached executions currently in flight"
            )
            .map_err(registration("ecorpc_cache_in_flight"))?,

            rpc_requests_total: register_counter_vec!(
                "ecorpc_rpc_requests_total",
                "Total number of RPC requests",
                &["method", "code"]
            )
            .map_err(registration("ecorpc_rpc_requests_total"))?,

            rpc_request_duration_seconds: register_histogram_vec!(
                "ecorpc_rpc_request_duration_seconds",
                "RPC request duration in seconds",
                &["method"],
                RPC_LATENCY_BUCKETS.to_vec()
            )
            .map_err(registration("ecorpc_rpc_request_duration_seconds"))?,
        })
    }

    /// Record one cache lookup.
    pub fn record_lookup(&self, method: &str, result: &str) {
        self.cache_lookups_total
            .with_label_values(&[method, result])
            .inc();
    }

    pub fn record_compute(&self, method: &str, duration_secs: f64) {
        self.cache_compute_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn set_in_flight(&self, count: usize) {
        self.cache_in_flight.set(count as f64);
    }

    /// Record a completed RPC.
    pub fn record_rpc(&self, method: &str, code: i32, duration_secs: f64) {
        let code_str = code.to_string();
        self.rpc_requests_total
            .with_label_values(&[method, &code_str])
            .inc();
        self.rpc_request_duration_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }
}

/// Registered metrics, if registration succeeded.
pub fn metrics() -> Option<&'static RpcMetrics> {
    METRICS.as_ref().ok()
}

/// Render every registered metric in the Prometheus text format.
pub fn render_metrics() -> Result<String, TelemetryError> {
    // Force registration so the families exist even before the first call.
    let _ = metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| TelemetryError::Encode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Encode(e.to_string()))
}
