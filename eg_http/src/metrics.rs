//! ABOUTME: Prometheus families for outbound HTTP requests
//! ABOUTME: Label sets are (method, host) plus status code for outcome counters

use eg_core::Result;
use eg_metrics::{latency_histogram, MetricsRegistry, ObservationGuard};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, family::Family, gauge::Gauge, histogram::Histogram,
};
use reqwest::{Request, StatusCode, Url};

pub const IN_FLIGHT: &str = "http_outbound_requests_in_flight";
/// Exposed as `http_outbound_requests_total`
pub const REQUESTS: &str = "http_outbound_requests";
/// Exposed as `http_outbound_requests_status_total`
pub const REQUEST_STATUS: &str = "http_outbound_requests_status";
pub const REQUEST_DURATION: &str = "http_outbound_request_duration_seconds";

/// Labels for in-flight gauges, request counters, and latency histograms
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Lower-cased HTTP method
    pub method: String,
    /// Destination host, with the port when the URL names one
    pub host: String,
}

impl RequestLabels {
    pub fn new(method: &str, host: &str) -> Self {
        Self {
            method: method.to_ascii_lowercase(),
            host: host.to_string(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method().as_str(), &host_label(request.url()))
    }
}

/// Labels for the per-status-code counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub method: String,
    pub host: String,
    pub code: String,
}

impl StatusLabels {
    pub fn new(request: &RequestLabels, status: StatusCode) -> Self {
        Self {
            method: request.method.clone(),
            host: request.host.clone(),
            code: status.as_u16().to_string(),
        }
    }
}

fn host_label(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Shared outbound HTTP families
///
/// Every client registered against the same registry shares these series.
#[derive(Clone, Debug)]
pub struct HttpClientMetrics {
    in_flight: Family<RequestLabels, Gauge>,
    requests: Family<RequestLabels, Counter>,
    status: Family<StatusLabels, Counter>,
    duration: Family<RequestLabels, Histogram>,
}

impl HttpClientMetrics {
    /// Look up or create the outbound HTTP families in `registry`
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            in_flight: registry.get_or_register(
                IN_FLIGHT,
                "In Flight Outbound HTTP requests",
                Family::default,
            )?,
            requests: registry.get_or_register(
                REQUESTS,
                "Counter of successful Outbound HTTP requests",
                Family::default,
            )?,
            status: registry.get_or_register(
                REQUEST_STATUS,
                "Counter of successful Outbound HTTP requests by status code",
                Family::default,
            )?,
            duration: registry.get_or_register(
                REQUEST_DURATION,
                "Histogram of latencies for Outbound HTTP requests",
                || Family::new_with_constructor(latency_histogram as fn() -> Histogram),
            )?,
        })
    }

    /// Count the request as in flight until the returned guard drops
    pub(crate) fn track(&self, labels: &RequestLabels) -> ObservationGuard {
        // Clone the metrics out so no family lock is held across the await
        let histogram = self.duration.get_or_create(labels).clone();
        let in_flight = self.in_flight.get_or_create(labels).clone();
        ObservationGuard::with_in_flight(histogram, in_flight)
    }

    pub(crate) fn record_response(&self, labels: &RequestLabels, status: StatusCode) {
        self.requests.get_or_create(labels).inc();
        self.status
            .get_or_create(&StatusLabels::new(labels, status))
            .inc();
    }

    /// Current in-flight count for (method, host); reading never creates a series
    pub fn in_flight(&self, method: &str, host: &str) -> i64 {
        self.in_flight
            .get(&RequestLabels::new(method, host))
            .map(|gauge| gauge.get())
            .unwrap_or(0)
    }

    /// Completed requests that produced a response for (method, host)
    pub fn requests(&self, method: &str, host: &str) -> u64 {
        self.requests
            .get(&RequestLabels::new(method, host))
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    /// Responses with `code` for (method, host)
    pub fn status_count(&self, method: &str, host: &str, code: u16) -> u64 {
        let request = RequestLabels::new(method, host);
        let labels = StatusLabels {
            method: request.method,
            host: request.host,
            code: code.to_string(),
        };
        self.status
            .get(&labels)
            .map(|counter| counter.get())
            .unwrap_or(0)
    }
}
