//! ABOUTME: Shared metric registry, latency buckets, and pull-based metric sources
//! ABOUTME: Built on prometheus-client; used by the HTTP and SQL instrumentation

pub mod guard;
pub mod registry;
pub mod source;

pub use guard::ObservationGuard;
pub use registry::{MetricsRegistry, SourceRegistration};
pub use source::{ConstLabels, Descriptor, MetricSource, Sample, SampleKind};

use prometheus_client::metrics::histogram::Histogram;

/// Latency bucket boundaries in seconds, shared by every outbound histogram so
/// HTTP and SQL latencies can be compared on the same dashboard.
pub const LATENCY_BUCKETS: [f64; 13] = [
    0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.4, 1.0, 3.0, 8.0, 20.0, 60.0, 120.0,
];

/// Build a histogram over [`LATENCY_BUCKETS`]
///
/// Usable directly as a `Family` constructor.
pub fn latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS.into_iter())
}
