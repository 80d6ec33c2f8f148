//! ABOUTME: Core errors, tracing setup, and timing utilities
//! ABOUTME: Foundation crate used by all other egress components

pub mod error;
pub mod telemetry;
pub mod time;

pub use error::{Error, Result};
pub use time::MonotonicTimer;
