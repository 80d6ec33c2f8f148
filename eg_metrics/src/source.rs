//! ABOUTME: Pull-based metric sources read synchronously on every scrape
//! ABOUTME: A source describes its series up front and produces values on demand

use std::fmt;

use prometheus_client::encoding::{EncodeMetric, MetricEncoder};
use prometheus_client::metrics::{counter::ConstCounter, gauge::ConstGauge, MetricType};

/// Constant label pairs attached to every sample of a registered source
pub type ConstLabels = Vec<(String, String)>;

/// How a sample is typed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Monotonic total
    Counter,
    /// Current value
    Gauge,
}

impl SampleKind {
    pub fn metric_type(&self) -> MetricType {
        match self {
            SampleKind::Counter => MetricType::Counter,
            SampleKind::Gauge => MetricType::Gauge,
        }
    }
}

/// Static description of one series a source can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub name: &'static str,
    /// Emitted verbatim as the `# HELP` line
    pub help: &'static str,
    pub kind: SampleKind,
}

impl Descriptor {
    pub const fn counter(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: SampleKind::Counter,
        }
    }

    pub const fn gauge(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: SampleKind::Gauge,
        }
    }

    /// Pair this descriptor with a freshly read value
    pub fn sample(&self, value: f64) -> Sample {
        Sample {
            descriptor: *self,
            value,
        }
    }
}

/// A point value produced during collection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub descriptor: Descriptor,
    pub value: f64,
}

impl Sample {
    pub(crate) fn encode(&self, encoder: MetricEncoder) -> Result<(), fmt::Error> {
        match self.descriptor.kind {
            SampleKind::Counter => ConstCounter::new(self.value).encode(encoder),
            SampleKind::Gauge => ConstGauge::new(self.value).encode(encoder),
        }
    }
}

/// A self-describing source of point-in-time values
///
/// `collect` runs on the scrape path while other sources and live operations
/// proceed, so it must only take a snapshot and never block on I/O.
pub trait MetricSource: fmt::Debug + Send + Sync + 'static {
    /// Every series this source can emit
    fn describe(&self) -> &[Descriptor];

    /// Current values, one sample per described series
    fn collect(&self) -> Vec<Sample>;
}
