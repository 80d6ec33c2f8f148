//! ABOUTME: SQL command latency histogram and the pool statistics metric source
//! ABOUTME: Pool series are read from the wrapped handle on every scrape

use std::fmt;
use std::sync::Arc;

use eg_core::Result;
use eg_metrics::{
    latency_histogram, ConstLabels, Descriptor, MetricSource, MetricsRegistry, ObservationGuard,
    Sample,
};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{family::Family, histogram::Histogram};

use crate::handle::{PoolStats, SqlHandle};

pub const COMMAND_DURATION: &str = "sql_command_duration_seconds";

pub const MAX_OPEN: Descriptor = Descriptor::gauge(
    "sql_stats_connections_max_open",
    "Maximum number of open connections to the database.",
);
pub const OPEN: Descriptor = Descriptor::gauge(
    "sql_stats_connections_open",
    "The number of established connections both in use and idle.",
);
pub const IN_USE: Descriptor = Descriptor::gauge(
    "sql_stats_connections_in_use",
    "The number of connections currently in use.",
);
pub const IDLE: Descriptor = Descriptor::gauge(
    "sql_stats_connections_idle",
    "The number of idle connections.",
);
pub const WAITED_FOR: Descriptor = Descriptor::counter(
    "sql_stats_connections_waited_for",
    "The total number of connections waited for.",
);
pub const BLOCKED_SECONDS: Descriptor = Descriptor::counter(
    "sql_stats_connections_blocked_seconds",
    "The total time blocked waiting for a new connection.",
);
pub const CLOSED_MAX_IDLE: Descriptor = Descriptor::counter(
    "sql_stats_connections_closed_max_idle",
    "The total number of connections closed due to the max idle limit.",
);
pub const CLOSED_MAX_LIFETIME: Descriptor = Descriptor::counter(
    "sql_stats_connections_closed_max_lifetime",
    "The total number of connections closed due to the max lifetime limit.",
);

pub const POOL_DESCRIPTORS: [Descriptor; 8] = [
    MAX_OPEN,
    OPEN,
    IN_USE,
    IDLE,
    WAITED_FOR,
    BLOCKED_SECONDS,
    CLOSED_MAX_IDLE,
    CLOSED_MAX_LIFETIME,
];

/// Kind of operation being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Exec,
    Query,
    QueryRow,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Exec => "exec",
            Command::Query => "query",
            Command::QueryRow => "query_row",
        }
    }
}

/// Which database a handle talks to; the constant labels of its pool series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbIdentity {
    pub driver: String,
    pub database: String,
    pub host: String,
}

impl DbIdentity {
    pub fn new(driver: &str, database: &str, host: &str) -> Self {
        Self {
            driver: driver.to_string(),
            database: database.to_string(),
            host: host.to_string(),
        }
    }

    pub fn const_labels(&self) -> ConstLabels {
        vec![
            ("driver".to_string(), self.driver.clone()),
            ("database".to_string(), self.database.clone()),
            ("host".to_string(), self.host.clone()),
        ]
    }
}

/// Labels for the per-command latency histogram
///
/// `query` is the literal statement text; callers own its cardinality.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub driver: String,
    pub database: String,
    pub host: String,
    pub command: String,
    pub query: String,
}

impl CommandLabels {
    pub fn new(identity: &DbIdentity, command: Command, query: &str) -> Self {
        Self {
            driver: identity.driver.clone(),
            database: identity.database.clone(),
            host: identity.host.clone(),
            command: command.as_str().to_string(),
            query: query.to_string(),
        }
    }
}

/// Latency histogram shared by every instrumented handle on a registry
#[derive(Clone, Debug)]
pub struct SqlCommandMetrics {
    duration: Family<CommandLabels, Histogram>,
}

impl SqlCommandMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let duration = registry.get_or_register(
            COMMAND_DURATION,
            "Histogram of latencies for SQL requests",
            || Family::new_with_constructor(latency_histogram as fn() -> Histogram),
        )?;
        Ok(Self { duration })
    }

    /// Time one command until the returned guard drops
    pub fn time(&self, identity: &DbIdentity, command: Command, query: &str) -> ObservationGuard {
        let labels = CommandLabels::new(identity, command, query);
        ObservationGuard::start(self.duration.get_or_create(&labels).clone())
    }
}

/// Map a pool snapshot onto the eight pool series
pub fn pool_samples(stats: &PoolStats) -> Vec<Sample> {
    vec![
        MAX_OPEN.sample(stats.max_open as f64),
        OPEN.sample(stats.open as f64),
        IN_USE.sample(stats.in_use as f64),
        IDLE.sample(stats.idle as f64),
        WAITED_FOR.sample(stats.wait_count as f64),
        BLOCKED_SECONDS.sample(stats.wait_duration.as_secs_f64()),
        CLOSED_MAX_IDLE.sample(stats.max_idle_closed as f64),
        CLOSED_MAX_LIFETIME.sample(stats.max_lifetime_closed as f64),
    ]
}

/// Scrape-time reader of a handle's pool statistics
pub(crate) struct PoolStatsSource<H> {
    handle: Arc<H>,
}

impl<H> PoolStatsSource<H> {
    pub(crate) fn new(handle: Arc<H>) -> Self {
        Self { handle }
    }
}

impl<H> fmt::Debug for PoolStatsSource<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolStatsSource").finish_non_exhaustive()
    }
}

impl<H: SqlHandle> MetricSource for PoolStatsSource<H> {
    fn describe(&self) -> &[Descriptor] {
        &POOL_DESCRIPTORS
    }

    fn collect(&self) -> Vec<Sample> {
        pool_samples(&self.handle.stats())
    }
}
