//! ABOUTME: Database handle decorator timing every command and exposing pool statistics
//! ABOUTME: Registers a pull-based pool source on construction and drops it on close

use std::sync::Arc;
use std::time::Duration;

use eg_config::DatabaseConfig;
use eg_core::{Error, Result};
use eg_metrics::{MetricsRegistry, SourceRegistration};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::context::CallContext;
use crate::descriptor::ConnectionDescriptor;
use crate::handle::{PoolSettings, PoolStats, SqlHandle, Value};
use crate::metrics::{Command, DbIdentity, PoolStatsSource, SqlCommandMetrics};
use crate::sqlx_handle::SqlxHandle;

/// A [`SqlHandle`] whose commands are timed and whose pool is scraped live
///
/// Errors from the wrapped handle are returned unchanged. Once closed, the
/// wrapper keeps delegating and leaves rejecting calls to the handle.
pub struct InstrumentedDb<H: SqlHandle = SqlxHandle> {
    handle: Arc<H>,
    identity: DbIdentity,
    commands: SqlCommandMetrics,
    registry: Arc<MetricsRegistry>,
    registration: Mutex<Option<SourceRegistration>>,
}

impl<H: SqlHandle> std::fmt::Debug for InstrumentedDb<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedDb")
            .field("identity", &self.identity)
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

impl InstrumentedDb<SqlxHandle> {
    /// Parse `descriptor`, open a lazy sqlx pool, and instrument it
    pub fn connect(descriptor: &str, registry: Arc<MetricsRegistry>) -> Result<Self> {
        Self::connect_with(descriptor, PoolSettings::default(), registry)
    }

    pub fn connect_with(
        descriptor: &str,
        settings: PoolSettings,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let descriptor = ConnectionDescriptor::parse(descriptor)?;
        let handle = SqlxHandle::open(&descriptor, settings)?;
        Self::new(handle, descriptor.identity(), registry)
    }

    pub fn from_config(config: &DatabaseConfig, registry: Arc<MetricsRegistry>) -> Result<Self> {
        Self::connect_with(&config.url, PoolSettings::from(config), registry)
    }
}

impl<H: SqlHandle> InstrumentedDb<H> {
    /// Instrument an already opened handle under the given labels
    ///
    /// Fails without registering anything if the driver label is empty or the
    /// pool series for this identity are already registered.
    pub fn new(handle: H, identity: DbIdentity, registry: Arc<MetricsRegistry>) -> Result<Self> {
        if identity.driver.trim().is_empty() {
            return Err(Error::Config(
                "database handle needs a driver label".to_string(),
            ));
        }

        let commands = SqlCommandMetrics::register(&registry)?;
        let handle = Arc::new(handle);
        let source = Arc::new(PoolStatsSource::new(Arc::clone(&handle)));
        let registration = registry.register_source(identity.const_labels(), source)?;

        info!(
            driver = %identity.driver,
            database = %identity.database,
            host = %identity.host,
            "Registered database pool metrics"
        );

        Ok(Self {
            handle,
            identity,
            commands,
            registry,
            registration: Mutex::new(Some(registration)),
        })
    }

    pub fn identity(&self) -> &DbIdentity {
        &self.identity
    }

    /// The wrapped handle, for operations that are not instrumented
    pub fn inner(&self) -> &H {
        &self.handle
    }

    /// Whether the pool series are still part of the scrape
    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    pub fn stats(&self) -> PoolStats {
        self.handle.stats()
    }

    pub async fn ping(&self) -> std::result::Result<(), H::Error> {
        self.ping_with_context(&CallContext::background()).await
    }

    pub async fn ping_with_context(&self, ctx: &CallContext) -> std::result::Result<(), H::Error> {
        let _guard = self.commands.time(&self.identity, Command::Ping, "");
        let result = self.handle.ping(ctx).await;
        self.log_failure(Command::Ping, &result);
        result
    }

    pub async fn exec(
        &self,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<H::Outcome, H::Error> {
        self.exec_with_context(&CallContext::background(), query, args)
            .await
    }

    pub async fn exec_with_context(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<H::Outcome, H::Error> {
        let _guard = self.commands.time(&self.identity, Command::Exec, query);
        let result = self.handle.exec(ctx, query, args).await;
        self.log_failure(Command::Exec, &result);
        result
    }

    pub async fn query(
        &self,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<Vec<H::Row>, H::Error> {
        self.query_with_context(&CallContext::background(), query, args)
            .await
    }

    pub async fn query_with_context(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<Vec<H::Row>, H::Error> {
        let _guard = self.commands.time(&self.identity, Command::Query, query);
        let result = self.handle.query(ctx, query, args).await;
        self.log_failure(Command::Query, &result);
        result
    }

    pub async fn query_row(
        &self,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<H::Row, H::Error> {
        self.query_row_with_context(&CallContext::background(), query, args)
            .await
    }

    pub async fn query_row_with_context(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> std::result::Result<H::Row, H::Error> {
        let _guard = self.commands.time(&self.identity, Command::QueryRow, query);
        let result = self.handle.query_row(ctx, query, args).await;
        self.log_failure(Command::QueryRow, &result);
        result
    }

    pub fn set_max_open_conns(&self, n: u32) {
        self.handle.set_max_open_conns(n);
    }

    pub fn set_max_idle_conns(&self, n: u32) {
        self.handle.set_max_idle_conns(n);
    }

    pub fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.handle.set_conn_max_lifetime(lifetime);
    }

    pub fn set_conn_max_idle_time(&self, idle_time: Option<Duration>) {
        self.handle.set_conn_max_idle_time(idle_time);
    }

    /// Drop the pool series from the scrape, then close the wrapped handle
    ///
    /// Safe to call more than once; later calls only repeat the handle's close.
    pub async fn close(&self) -> std::result::Result<(), H::Error> {
        self.unregister();
        self.handle.close().await
    }

    fn unregister(&self) {
        if let Some(registration) = self.registration.lock().take() {
            self.registry.unregister(&registration);
            info!(
                driver = %self.identity.driver,
                database = %self.identity.database,
                host = %self.identity.host,
                "Unregistered database pool metrics"
            );
        }
    }

    fn log_failure<T>(&self, command: Command, result: &std::result::Result<T, H::Error>) {
        if let Err(e) = result {
            debug!(
                driver = %self.identity.driver,
                database = %self.identity.database,
                command = command.as_str(),
                error = %e,
                "Database command failed"
            );
        }
    }
}

impl<H: SqlHandle> Drop for InstrumentedDb<H> {
    fn drop(&mut self) {
        self.unregister();
    }
}
