//! ABOUTME: Instrumented SQL handle with per-command latency and live pool statistics
//! ABOUTME: Wraps any SqlHandle; ships an sqlx Any-pool handle for URL-based connects

pub mod context;
pub mod descriptor;
pub mod handle;
pub mod instrumented;
pub mod metrics;
pub mod sqlx_handle;

pub use context::{CallContext, Interrupted};
pub use descriptor::{ConnectionDescriptor, Driver};
pub use handle::{PoolSettings, PoolStats, SqlHandle, Value};
pub use instrumented::InstrumentedDb;
pub use metrics::{Command, CommandLabels, DbIdentity, SqlCommandMetrics};
pub use sqlx_handle::{SqlxHandle, SqlxHandleError};
