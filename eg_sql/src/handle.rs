//! ABOUTME: The SQL handle contract the instrumented wrapper delegates to
//! ABOUTME: Operations, pool configuration setters, and pool statistics snapshots

use std::time::Duration;

use async_trait::async_trait;
use eg_config::DatabaseConfig;

use crate::context::CallContext;

/// Bind parameter for a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Point-in-time view of a handle's connection pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured limit; 0 means unlimited
    pub max_open: u32,
    /// Established connections, in use and idle
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
    /// Total acquisitions that had to wait for a connection
    pub wait_count: u64,
    /// Total time spent waiting for a connection
    pub wait_duration: Duration,
    /// Total connections closed because of the idle limit
    pub max_idle_closed: u64,
    /// Total connections closed because they reached their maximum lifetime
    pub max_lifetime_closed: u64,
}

/// Pool limits applied when a handle is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// 0 means unlimited
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Option<Duration>,
    pub conn_max_idle_time: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open_conns: 0,
            max_idle_conns: 2,
            conn_max_lifetime: None,
            conn_max_idle_time: None,
        }
    }
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_open_conns: config.max_open_conns,
            max_idle_conns: config.max_idle_conns,
            conn_max_lifetime: config.conn_max_lifetime(),
            conn_max_idle_time: config.conn_max_idle_time(),
        }
    }
}

/// A pooled SQL connection handle
///
/// Implementations own pooling, honour the [`CallContext`] they are given,
/// and reject operations after [`close`](SqlHandle::close) with their own
/// error.
#[async_trait]
pub trait SqlHandle: Send + Sync + 'static {
    type Row: Send;
    /// What a statement execution reports, e.g. rows affected
    type Outcome: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn ping(&self, ctx: &CallContext) -> Result<(), Self::Error>;

    async fn exec(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Self::Outcome, Self::Error>;

    async fn query(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Self::Row>, Self::Error>;

    /// Fetch exactly one row; no rows is an error
    async fn query_row(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Self::Row, Self::Error>;

    fn set_max_open_conns(&self, n: u32);

    fn set_max_idle_conns(&self, n: u32);

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>);

    fn set_conn_max_idle_time(&self, idle_time: Option<Duration>);

    /// Cheap snapshot; called on every scrape
    fn stats(&self) -> PoolStats;

    async fn close(&self) -> Result<(), Self::Error>;
}
