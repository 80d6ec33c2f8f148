//! ABOUTME: Instrumented outbound HTTP client
//! ABOUTME: Times every request and counts outcomes by method, host, and status code

pub mod client;
pub mod error;
pub mod metrics;
pub mod transport;

pub use client::InstrumentedClient;
pub use error::RequestError;
pub use metrics::{HttpClientMetrics, RequestLabels, StatusLabels};
pub use transport::HttpTransport;
