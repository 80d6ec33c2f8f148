//! ABOUTME: Scripted SQL handle with settable pool statistics and a closed state
//! ABOUTME: Records each call with the context it received

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eg_sql::{CallContext, Interrupted, PoolSettings, PoolStats, SqlHandle, Value};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MockSqlError {
    #[error("sql: database is closed")]
    Closed,

    #[error("mock sql failure: {0}")]
    Failed(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// One delegated call as the handle saw it
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCall {
    pub command: &'static str,
    pub query: String,
    pub args: Vec<Value>,
    pub had_deadline: bool,
    pub had_cancellation: bool,
}

#[derive(Debug, Default)]
struct Script {
    stats: PoolStats,
    settings: PoolSettings,
    rows: Vec<Vec<Value>>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: Vec<SqlCall>,
    close_count: usize,
}

/// A [`SqlHandle`] answering from a script
///
/// Rows are `Vec<Value>`; `exec` reports the number of bound arguments as
/// rows affected. Every call after `close` fails with [`MockSqlError::Closed`].
#[derive(Debug, Default)]
pub struct MockSqlHandle {
    script: Mutex<Script>,
    closed: AtomicBool,
}

impl MockSqlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, rows: Vec<Vec<Value>>) -> Self {
        self.script.lock().rows = rows;
        self
    }

    /// Hold every operation open for `delay`, subject to the call's context
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = Some(delay);
        self
    }

    pub fn set_stats(&self, stats: PoolStats) {
        self.script.lock().stats = stats;
    }

    /// Make every following operation fail with `message`
    pub fn fail_with(&self, message: &str) {
        self.script.lock().failure = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<SqlCall> {
        self.script.lock().calls.clone()
    }

    pub fn settings(&self) -> PoolSettings {
        self.script.lock().settings
    }

    pub fn close_count(&self) -> usize {
        self.script.lock().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn respond(
        &self,
        ctx: &CallContext,
        command: &'static str,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Vec<Value>>, MockSqlError> {
        let (delay, failure, rows) = {
            let mut script = self.script.lock();
            script.calls.push(SqlCall {
                command,
                query: query.to_string(),
                args: args.to_vec(),
                had_deadline: ctx.deadline().is_some(),
                had_cancellation: ctx.cancellation().is_some(),
            });
            (script.delay, script.failure.clone(), script.rows.clone())
        };

        if self.is_closed() {
            return Err(MockSqlError::Closed);
        }

        ctx.run(async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        })
        .await?;

        match failure {
            Some(message) => Err(MockSqlError::Failed(message)),
            None => Ok(rows),
        }
    }
}

#[async_trait]
impl SqlHandle for MockSqlHandle {
    type Row = Vec<Value>;
    type Outcome = u64;
    type Error = MockSqlError;

    async fn ping(&self, ctx: &CallContext) -> Result<(), Self::Error> {
        self.respond(ctx, "ping", "", &[]).await.map(|_| ())
    }

    async fn exec(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Self::Outcome, Self::Error> {
        self.respond(ctx, "exec", query, args)
            .await
            .map(|_| args.len() as u64)
    }

    async fn query(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Self::Row>, Self::Error> {
        self.respond(ctx, "query", query, args).await
    }

    async fn query_row(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Self::Row, Self::Error> {
        let rows = self.respond(ctx, "query_row", query, args).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| MockSqlError::Failed("no rows in result set".to_string()))
    }

    fn set_max_open_conns(&self, n: u32) {
        self.script.lock().settings.max_open_conns = n;
    }

    fn set_max_idle_conns(&self, n: u32) {
        self.script.lock().settings.max_idle_conns = n;
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.script.lock().settings.conn_max_lifetime = lifetime;
    }

    fn set_conn_max_idle_time(&self, idle_time: Option<Duration>) {
        self.script.lock().settings.conn_max_idle_time = idle_time;
    }

    fn stats(&self) -> PoolStats {
        self.script.lock().stats
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.script.lock().close_count += 1;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
