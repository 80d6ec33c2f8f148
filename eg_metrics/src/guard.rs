//! ABOUTME: Scoped observation that always records, whatever the exit path
//! ABOUTME: Pairs in-flight gauge increments with exactly one decrement and latency sample

use eg_core::MonotonicTimer;
use prometheus_client::metrics::{gauge::Gauge, histogram::Histogram};

/// Records one latency observation when dropped
///
/// Created just before a delegate call. Drop runs on normal return, on `?`
/// early exit, during panic unwinding, and when the enclosing future is
/// dropped mid-await, so the in-flight gauge is always decremented exactly
/// once per increment.
#[must_use = "dropping the guard immediately records a zero-length observation"]
#[derive(Debug)]
pub struct ObservationGuard {
    histogram: Histogram,
    in_flight: Option<Gauge>,
    timer: MonotonicTimer,
}

impl ObservationGuard {
    /// Time a call into `histogram`
    pub fn start(histogram: Histogram) -> Self {
        Self {
            histogram,
            in_flight: None,
            timer: MonotonicTimer::new(),
        }
    }

    /// Time a call into `histogram` and count it in `in_flight` until drop
    pub fn with_in_flight(histogram: Histogram, in_flight: Gauge) -> Self {
        in_flight.inc();
        Self {
            histogram,
            in_flight: Some(in_flight),
            timer: MonotonicTimer::new(),
        }
    }
}

impl Drop for ObservationGuard {
    fn drop(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.dec();
        }
        self.histogram.observe(self.timer.elapsed_seconds());
    }
}
