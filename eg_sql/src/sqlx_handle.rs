//! ABOUTME: SqlHandle implementation over a lazily connected sqlx Any pool
//! ABOUTME: Tracks connection waits itself since sqlx does not report them

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eg_core::{Error, MonotonicTimer, Result};
use parking_lot::{Mutex, RwLock};
use sqlx::any::{install_default_drivers, AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Connection};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::context::{CallContext, Interrupted};
use crate::descriptor::ConnectionDescriptor;
use crate::handle::{PoolSettings, PoolStats, SqlHandle, Value};

/// Pool size used when no limit is configured; sqlx needs a finite bound
const UNLIMITED_MAX_CONNECTIONS: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SqlxHandleError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Pool together with the settings it was built with
#[derive(Debug)]
struct ActivePool {
    pool: AnyPool,
    settings: PoolSettings,
}

/// A pooled connection handle backed by sqlx
///
/// sqlx fixes pool options when a pool is built. The setters only record the
/// requested settings; [`SqlxHandle::reopen`] builds a pool with them. Until
/// then the current pool, its connections, and any in-memory database keep
/// running unchanged.
pub struct SqlxHandle {
    target: String,
    descriptor: ConnectionDescriptor,
    active: RwLock<ActivePool>,
    requested: Mutex<PoolSettings>,
    closed: AtomicBool,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

impl fmt::Debug for SqlxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlxHandle")
            .field("descriptor", &self.descriptor)
            .field("settings", &self.active.read().settings)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SqlxHandle {
    /// Build a lazily connected pool; no connection is made until first use
    ///
    /// A lifetime or idle limit needs a tokio runtime on the calling thread,
    /// since sqlx spawns its reaper task; without one this is a config error.
    pub fn open(descriptor: &ConnectionDescriptor, settings: PoolSettings) -> Result<Self> {
        install_default_drivers();
        let pool = build_pool(descriptor.target(), &settings)?;

        debug!(
            driver = %descriptor.driver(),
            database = %descriptor.database(),
            host = %descriptor.host(),
            "Opened lazy sqlx pool"
        );

        Ok(Self {
            target: descriptor.target().to_string(),
            descriptor: descriptor.clone(),
            active: RwLock::new(ActivePool { pool, settings }),
            requested: Mutex::new(settings),
            closed: AtomicBool::new(false),
            wait_count: AtomicU64::new(0),
            wait_nanos: AtomicU64::new(0),
        })
    }

    /// The current sqlx pool, for operations this handle does not wrap
    pub fn pool(&self) -> AnyPool {
        self.active.read().pool.clone()
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Settings recorded by the setters, applied on the next [`reopen`](Self::reopen)
    pub fn settings(&self) -> PoolSettings {
        *self.requested.lock()
    }

    /// Settings the current pool was built with
    pub fn applied_settings(&self) -> PoolSettings {
        self.active.read().settings
    }

    /// Replace the pool with one built from the requested settings
    ///
    /// Connections checked out of the previous pool finish their work and are
    /// dropped when released. An in-memory database lives in its connections,
    /// so reopening one starts from an empty database.
    pub fn reopen(&self) -> Result<()> {
        let mut active = self.active.write();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Config("sqlx handle is closed".to_string()));
        }

        let settings = *self.requested.lock();
        let pool = build_pool(&self.target, &settings)?;
        *active = ActivePool { pool, settings };

        info!(
            driver = %self.descriptor.driver(),
            database = %self.descriptor.database(),
            settings = ?settings,
            "Reopened sqlx pool with new settings"
        );
        Ok(())
    }

    fn request(&self, update: impl FnOnce(&mut PoolSettings)) {
        let mut requested = self.requested.lock();
        update(&mut requested);
        debug!(settings = ?*requested, "Recorded sqlx pool settings; applied on reopen");
    }

    async fn acquire(
        &self,
        ctx: &CallContext,
    ) -> std::result::Result<PoolConnection<Any>, SqlxHandleError> {
        let pool = self.pool();
        let saturated =
            pool.num_idle() == 0 && pool.size() >= pool.options().get_max_connections();

        let timer = MonotonicTimer::new();
        let acquired = ctx.run(pool.acquire()).await;
        if saturated {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            self.wait_nanos
                .fetch_add(timer.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }

        Ok(acquired??)
    }
}

fn build_pool(target: &str, settings: &PoolSettings) -> Result<AnyPool> {
    let reaps = settings.conn_max_lifetime.is_some() || settings.conn_max_idle_time.is_some();
    if reaps && Handle::try_current().is_err() {
        return Err(Error::Config(
            "connection lifetime and idle limits need a tokio runtime".to_string(),
        ));
    }

    let max_connections = match settings.max_open_conns {
        0 => UNLIMITED_MAX_CONNECTIONS,
        n => n,
    };

    AnyPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .max_lifetime(settings.conn_max_lifetime)
        .idle_timeout(settings.conn_max_idle_time)
        .connect_lazy(target)
        .map_err(|e| Error::Config(format!("Failed to open sqlx pool: {}", e)))
}

fn bind_values<'q>(query: &'q str, args: &'q [Value]) -> Query<'q, Any, AnyArguments<'q>> {
    args.iter().fold(sqlx::query(query), |q, value| match value {
        Value::Null => q.bind(None::<String>),
        Value::Bool(v) => q.bind(*v),
        Value::Int(v) => q.bind(*v),
        Value::Float(v) => q.bind(*v),
        Value::Text(v) => q.bind(v.as_str()),
        Value::Bytes(v) => q.bind(v.as_slice()),
    })
}

#[async_trait]
impl SqlHandle for SqlxHandle {
    type Row = AnyRow;
    type Outcome = AnyQueryResult;
    type Error = SqlxHandleError;

    async fn ping(&self, ctx: &CallContext) -> std::result::Result<(), Self::Error> {
        let mut conn = self.acquire(ctx).await?;
        ctx.run(conn.ping()).await??;
        Ok(())
    }

    async fn exec(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<Self::Outcome, Self::Error> {
        let mut conn = self.acquire(ctx).await?;
        let outcome = ctx
            .run(bind_values(query, args).execute(&mut *conn))
            .await??;
        Ok(outcome)
    }

    async fn query(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<Vec<Self::Row>, Self::Error> {
        let mut conn = self.acquire(ctx).await?;
        let rows = ctx
            .run(bind_values(query, args).fetch_all(&mut *conn))
            .await??;
        Ok(rows)
    }

    async fn query_row(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<Self::Row, Self::Error> {
        let mut conn = self.acquire(ctx).await?;
        let row = ctx
            .run(bind_values(query, args).fetch_one(&mut *conn))
            .await??;
        Ok(row)
    }

    fn set_max_open_conns(&self, n: u32) {
        self.request(|settings| settings.max_open_conns = n);
    }

    fn set_max_idle_conns(&self, n: u32) {
        self.request(|settings| settings.max_idle_conns = n);
        warn!(
            max_idle_conns = n,
            "sqlx pools do not cap idle connections; use the idle time limit instead"
        );
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.request(|settings| settings.conn_max_lifetime = lifetime);
    }

    fn set_conn_max_idle_time(&self, idle_time: Option<Duration>) {
        self.request(|settings| settings.conn_max_idle_time = idle_time);
    }

    fn stats(&self) -> PoolStats {
        let (pool, max_open) = {
            let active = self.active.read();
            (active.pool.clone(), active.settings.max_open_conns)
        };
        let open = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);

        PoolStats {
            max_open,
            open,
            in_use: open.saturating_sub(idle),
            idle,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
            // sqlx reaps idle and expired connections without reporting them
            max_idle_closed: 0,
            max_lifetime_closed: 0,
        }
    }

    async fn close(&self) -> std::result::Result<(), Self::Error> {
        // Marked under the write lock so a concurrent reopen cannot swap in a live pool
        let pool = {
            let active = self.active.write();
            self.closed.store(true, Ordering::SeqCst);
            active.pool.clone()
        };
        pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    fn memory_handle() -> SqlxHandle {
        let descriptor = ConnectionDescriptor::parse("sqlite::memory:").unwrap();
        // One connection, otherwise each connection sees its own empty database
        let settings = PoolSettings {
            max_open_conns: 1,
            ..PoolSettings::default()
        };
        SqlxHandle::open(&descriptor, settings).unwrap()
    }

    #[tokio::test]
    async fn test_open_is_lazy() {
        let handle = memory_handle();
        let stats = handle.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.max_open, 1);
    }

    #[tokio::test]
    async fn test_exec_query_and_query_row() {
        let handle = memory_handle();
        let ctx = CallContext::background();

        handle
            .exec(&ctx, "CREATE TABLE jobs (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .await
            .unwrap();
        let outcome = handle
            .exec(
                &ctx,
                "INSERT INTO jobs (id, name) VALUES (?, ?), (?, ?)",
                &[1.into(), "scan".into(), 2.into(), "sweep".into()],
            )
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected(), 2);

        let rows = handle
            .query(&ctx, "SELECT name FROM jobs ORDER BY id", &[])
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>(0)).collect();
        assert_eq!(names, vec!["scan".to_string(), "sweep".to_string()]);

        let row = handle
            .query_row(&ctx, "SELECT id FROM jobs WHERE name = ?", &["sweep".into()])
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>(0), 2);

        let missing = handle
            .query_row(&ctx, "SELECT id FROM jobs WHERE name = ?", &["none".into()])
            .await;
        assert!(matches!(
            missing,
            Err(SqlxHandleError::Sqlx(sqlx::Error::RowNotFound))
        ));

        let stats = handle.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let handle = memory_handle();
        handle.ping(&CallContext::background()).await.unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        let after = handle.ping(&CallContext::background()).await;
        assert!(matches!(
            after,
            Err(SqlxHandleError::Sqlx(sqlx::Error::PoolClosed))
        ));
    }

    #[tokio::test]
    async fn test_setters_apply_on_reopen() {
        let handle = memory_handle();
        handle.set_max_open_conns(4);
        handle.set_conn_max_idle_time(Some(Duration::from_secs(60)));

        assert_eq!(handle.settings().max_open_conns, 4);
        assert_eq!(handle.applied_settings().max_open_conns, 1);
        assert_eq!(handle.pool().options().get_max_connections(), 1);
        assert_eq!(handle.stats().max_open, 1);

        handle.reopen().unwrap();
        assert_eq!(handle.applied_settings(), handle.settings());
        assert_eq!(handle.pool().options().get_max_connections(), 4);
        assert_eq!(handle.stats().max_open, 4);
    }

    #[tokio::test]
    async fn test_setters_keep_live_connections() {
        let handle = memory_handle();
        let ctx = CallContext::background();
        handle.ping(&ctx).await.unwrap();
        let pool = handle.pool();

        handle.set_conn_max_lifetime(Some(Duration::from_secs(3600)));
        handle.set_max_idle_conns(0);

        assert!(pool.options().get_max_lifetime().is_none());
        assert_eq!(handle.stats().open, 1);
        assert_eq!(handle.settings().max_idle_conns, 0);
    }

    #[tokio::test]
    async fn test_setters_from_thread_without_runtime() {
        let handle = std::sync::Arc::new(memory_handle());
        handle.ping(&CallContext::background()).await.unwrap();

        let worker = std::sync::Arc::clone(&handle);
        let reopened = std::thread::spawn(move || {
            worker.set_conn_max_lifetime(Some(Duration::from_secs(60)));
            worker.set_conn_max_idle_time(Some(Duration::from_secs(30)));
            worker.set_max_open_conns(2);
            worker.reopen()
        })
        .join()
        .expect("setters must not panic off the runtime");

        assert!(matches!(reopened, Err(Error::Config(_))));
        assert_eq!(handle.applied_settings().max_open_conns, 1);
        assert_eq!(handle.stats().open, 1);
        handle.ping(&CallContext::background()).await.unwrap();
    }

    #[test]
    fn test_open_with_limits_needs_runtime() {
        let descriptor = ConnectionDescriptor::parse("sqlite::memory:").unwrap();
        let settings = PoolSettings {
            conn_max_lifetime: Some(Duration::from_secs(60)),
            ..PoolSettings::default()
        };

        let result = SqlxHandle::open(&descriptor, settings);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reopen_after_close_is_rejected() {
        let handle = memory_handle();
        handle.close().await.unwrap();

        handle.set_max_open_conns(8);
        assert!(matches!(handle.reopen(), Err(Error::Config(_))));

        let after = handle.ping(&CallContext::background()).await;
        assert!(matches!(
            after,
            Err(SqlxHandleError::Sqlx(sqlx::Error::PoolClosed))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_reopen_leaves_handle_closed() {
        for _ in 0..20 {
            let handle = std::sync::Arc::new(memory_handle());
            let reopener = std::sync::Arc::clone(&handle);
            let reopening = tokio::spawn(async move {
                for _ in 0..10 {
                    let _ = reopener.reopen();
                    tokio::task::yield_now().await;
                }
            });

            handle.close().await.unwrap();
            reopening.await.unwrap();

            assert!(handle.pool().is_closed());
            let after = handle.ping(&CallContext::background()).await;
            assert!(matches!(
                after,
                Err(SqlxHandleError::Sqlx(sqlx::Error::PoolClosed))
            ));
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_surfaces_interruption() {
        let handle = memory_handle();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = CallContext::background().with_cancellation(token);

        let result = handle.ping(&ctx).await;
        assert!(matches!(
            result,
            Err(SqlxHandleError::Interrupted(Interrupted::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_waits_counted_when_pool_is_saturated() {
        let handle = memory_handle();
        let held = handle.pool().acquire().await.unwrap();

        let ctx = CallContext::background().with_timeout(Duration::from_millis(50));
        let result = handle.ping(&ctx).await;
        assert!(matches!(
            result,
            Err(SqlxHandleError::Interrupted(Interrupted::DeadlineExceeded))
        ));
        drop(held);

        let stats = handle.stats();
        assert_eq!(stats.wait_count, 1);
        assert!(stats.wait_duration >= Duration::from_millis(40));
    }
}
