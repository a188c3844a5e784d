//! Connection manager: the one entry point for acquiring connections, with
//! health monitoring and automatic recovery behind it.

use crate::config::{DatabaseConfig, PoolTuning, ServerConfig, SessionCacheConfig};
use crate::database::connection::Connection;
use crate::database::health::{self, HealthMonitor};
use crate::database::metrics::{self, DiagnosisReport, ErrorKind, HealthReport, Metrics, MetricsSnapshot};
use crate::database::pool::{self, ConnectionPool, PoolFactory, PoolSettings, PoolStatus, ReleaseOutcome};
use crate::database::recovery::{Recoverable, RecoveryCoordinator, RecoveryOutcome, RecoverySettings};
use crate::database::registry::{ConnectionInfo, ConnectionRegistry};
use crate::database::result::{CellValue, QueryResult};
use crate::database::session::SessionCache;
use crate::database::traits::Backend;
use crate::error::{DatabaseError, DbResult, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

const RECOVERY_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of the managed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Ready,
    /// The pool was taken out of service by recovery.
    Degraded,
    Closed,
}

/// Output of [`ConnectionManager::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: PoolState,
    pub recovering: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
    pub metrics: MetricsSnapshot,
    pub registered_connections: usize,
    pub parked_sessions: Vec<String>,
    pub recovery_runs: u64,
}

struct ManagerInner {
    me: Weak<ManagerInner>,
    config: DatabaseConfig,
    tuning: PoolTuning,
    factory: PoolFactory,
    pool: RwLock<Option<ConnectionPool>>,
    state: RwLock<PoolState>,
    admission: Semaphore,
    recovery: RecoveryCoordinator,
    registry: ConnectionRegistry,
    metrics: Arc<Metrics>,
    sessions: SessionCache,
    monitor: HealthMonitor,
}

/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: DatabaseConfig,
        tuning: PoolTuning,
        sessions: SessionCacheConfig,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let settings = PoolSettings::from_config(&config, &tuning);
        let factory = PoolFactory::new(backend, config.clone(), settings, Arc::clone(&metrics));

        let inner = Arc::new_cyclic(|me| ManagerInner {
            me: me.clone(),
            factory,
            pool: RwLock::new(None),
            state: RwLock::new(PoolState::Uninitialized),
            admission: Semaphore::new(tuning.admission_permits),
            recovery: RecoveryCoordinator::new(RecoverySettings::from(&tuning)),
            registry: ConnectionRegistry::new(),
            metrics,
            sessions: SessionCache::new(sessions),
            monitor: HealthMonitor::new(),
            config,
            tuning,
        });
        Self { inner }
    }

    /// Manager for the database, tuning and session settings of `config`.
    pub fn from_config(config: &ServerConfig, backend: Arc<dyn Backend>) -> Self {
        Self::new(
            config.database.clone(),
            config.tuning.clone(),
            config.sessions.clone(),
            backend,
        )
    }

    /// Manager over the MySQL-protocol backend.
    #[cfg(feature = "mysql")]
    pub fn mysql(config: &ServerConfig) -> Self {
        Self::from_config(config, Arc::new(crate::database::MysqlBackend::new()))
    }

    /// Brings the pool up or fails.
    ///
    /// Validates the configuration, tests raw connectivity, creates and
    /// probes the pool, warms it up and starts the background tasks.
    ///
    /// # Errors
    ///
    /// Configuration errors, connectivity failures and a failed initial
    /// health probe are returned as-is.
    pub async fn initialize_strict(&self) -> Result<()> {
        self.inner.initialize().await
    }

    /// Like [`initialize_strict`](Self::initialize_strict) but reports failure
    /// as `false` so the server can start without a backend. Later acquires
    /// try to build the pool on demand.
    pub async fn initialize_best_effort(&self) -> bool {
        match self.inner.initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Database unavailable at startup, continuing without a pool: {}", e);
                false
            }
        }
    }

    /// Checks out a connection for `session` with the default acquisition
    /// timeout.
    pub async fn acquire(&self, session: &str) -> DbResult<Connection> {
        self.inner
            .acquire(session, self.inner.tuning.acquire_timeout)
            .await
    }

    pub async fn acquire_with_timeout(&self, session: &str, wait: Duration) -> DbResult<Connection> {
        self.inner.acquire(session, wait).await
    }

    /// Hands a connection back. Cacheable sessions park it for their next
    /// call; everything else goes back to the pool.
    pub async fn release(&self, session: &str, conn: Connection) {
        self.inner.release(session, conn).await
    }

    /// Acquire, execute, release.
    pub async fn execute_query(
        &self,
        session: &str,
        sql: &str,
        params: &[CellValue],
    ) -> DbResult<QueryResult> {
        let mut conn = self.acquire(session).await?;
        let result = conn.execute(sql, params).await;
        if let Err(e) = &result {
            self.inner.metrics.record_error(
                ErrorKind::QueryError,
                format!("Query execution failed for session {}: {}", session, e),
            );
        }
        self.release(session, conn).await;
        result
    }

    /// [`execute_query`](Self::execute_query) bounded by `limit`. A timed-out
    /// statement poisons its connection, which is then discarded.
    pub async fn execute_query_with_timeout(
        &self,
        session: &str,
        sql: &str,
        params: &[CellValue],
        limit: Duration,
    ) -> DbResult<QueryResult> {
        let mut conn = self.acquire(session).await?;
        let result = match timeout(limit, conn.execute(sql, params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.inner.metrics.record_error(
                    ErrorKind::QueryError,
                    format!("Query execution failed for session {}: {}", session, e),
                );
                Err(e)
            }
            Err(_) => {
                conn.mark_unhealthy();
                self.inner.metrics.record_error(
                    ErrorKind::QueryTimeout,
                    format!(
                        "Query timed out after {}s for session {}",
                        limit.as_secs(),
                        session
                    ),
                );
                Err(DatabaseError::QueryTimeout(limit.as_millis() as u64))
            }
        };
        self.release(session, conn).await;
        result
    }

    /// Probes the pool currently in service. Never triggers recovery.
    pub async fn test_connection(&self) -> bool {
        match self.inner.live_pool() {
            Some(pool) => health::probe(&pool, &self.inner.tuning, &self.inner.metrics).await,
            None => false,
        }
    }

    /// Tears the pool down and rebuilds it.
    pub async fn recover(&self) -> RecoveryOutcome {
        self.inner.recover().await
    }

    /// [`recover`](Self::recover) reported as a `Result`.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::PoolUnavailable`] when every attempt failed.
    pub async fn recreate_pool(&self) -> DbResult<()> {
        match self.inner.recover().await {
            RecoveryOutcome::Recovered { .. } => Ok(()),
            RecoveryOutcome::Failed { attempts } => Err(DatabaseError::PoolUnavailable(format!(
                "recovery failed after {} attempts",
                attempts
            ))),
        }
    }

    /// Returns the connection parked for `session` to the pool.
    pub async fn release_session(&self, session: &str) -> bool {
        match self.inner.sessions.take(session) {
            Some(conn) => {
                self.inner.return_to_pool(conn).await;
                true
            }
            None => false,
        }
    }

    pub fn get_status(&self) -> ManagerStatus {
        let inner = &self.inner;
        let pool = inner.refresh_counts();
        ManagerStatus {
            state: inner.state(),
            recovering: inner.recovery.is_recovering(),
            pool,
            metrics: inner.metrics.snapshot(),
            registered_connections: inner.registry.len(),
            parked_sessions: inner.sessions.keys(),
            recovery_runs: inner.recovery.runs(),
        }
    }

    /// Session key to the connection bound to it.
    pub fn get_sessions(&self) -> HashMap<String, ConnectionInfo> {
        self.inner.registry.sessions()
    }

    pub fn get_all_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.snapshot()
    }

    /// Runs a fresh probe and builds the full diagnosis.
    pub async fn diagnose(&self) -> DiagnosisReport {
        let inner = &self.inner;
        let probe_ok = match inner.live_pool() {
            Some(pool) => health::probe(&pool, &inner.tuning, &inner.metrics).await,
            None => false,
        };
        let status = inner.refresh_counts();
        metrics::diagnose(status.as_ref(), probe_ok, &inner.metrics)
    }

    pub fn health_report(&self) -> HealthReport {
        let status = self.inner.refresh_counts();
        metrics::health_report(status.as_ref(), &self.inner.metrics)
    }

    /// Sweeps the registry now instead of waiting for the background task.
    pub fn cleanup_registry(&self) -> usize {
        self.inner.cleanup_registry()
    }

    /// Stops background tasks, drops parked connections and closes the
    /// pool. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// The pool currently in service, if any.
    pub fn pool(&self) -> Option<ConnectionPool> {
        self.inner.current_pool()
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovery.is_recovering()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }
}

impl ManagerInner {
    fn state(&self) -> PoolState {
        *self.state.read()
    }

    fn current_pool(&self) -> Option<ConnectionPool> {
        self.pool.read().clone()
    }

    fn live_pool(&self) -> Option<ConnectionPool> {
        self.current_pool().filter(|pool| !pool.is_closed())
    }

    fn refresh_counts(&self) -> Option<PoolStatus> {
        let status = self.current_pool().map(|pool| pool.status());
        match &status {
            Some(status) => self
                .metrics
                .set_connection_counts(status.active(), status.free_size),
            None => self.metrics.set_connection_counts(0, 0),
        }
        status
    }

    async fn recover(&self) -> RecoveryOutcome {
        self.recovery.recover(self).await
    }

    #[instrument(skip(self), fields(endpoint = %self.config.endpoint()))]
    async fn initialize(&self) -> Result<()> {
        match self.state() {
            PoolState::Ready => return Ok(()),
            PoolState::Closed => return Err(DatabaseError::PoolClosed.into()),
            PoolState::Uninitialized | PoolState::Degraded => {}
        }

        self.config.validate()?;
        self.tuning.validate()?;

        info!("Testing connectivity before creating the pool");
        self.factory
            .check_connectivity(self.tuning.connectivity_timeout)
            .await?;

        let pool = self.factory.create().await?;
        if !health::probe(&pool, &self.tuning, &self.metrics).await {
            pool.close().await;
            return Err(DatabaseError::ConnectionFailed(
                "New connection pool failed its health check".into(),
            )
            .into());
        }

        self.attach(pool);
        self.warm_up().await;
        info!(
            max_connections = self.config.max_connections,
            "Connection pool initialized"
        );
        Ok(())
    }

    fn ensure_background(&self) {
        if self.monitor.is_running() {
            return;
        }

        let me = self.me.clone();
        self.monitor.spawn_periodic(
            "health_monitor",
            self.tuning.health_check_interval,
            move || {
                me.upgrade()
                    .map(|inner| async move { inner.health_cycle().await })
            },
        );

        let me = self.me.clone();
        self.monitor.spawn_periodic(
            "registry_cleanup",
            self.tuning.registry_cleanup_interval,
            move || {
                me.upgrade().map(|inner| async move {
                    inner.cleanup_registry();
                })
            },
        );
        debug!("Background tasks started");
    }

    async fn health_cycle(&self) {
        if self.recovery.is_recovering() {
            debug!("Recovery in progress, skipping health check");
            return;
        }
        let Some(_probe) = self.monitor.try_begin() else {
            debug!("Health check already running, skipping");
            return;
        };
        let Some(pool) = self.live_pool() else {
            debug!("No live pool, skipping health check");
            return;
        };

        if health::probe(&pool, &self.tuning, &self.metrics).await {
            self.metrics.record_health_check(Utc::now());
        } else {
            warn!(pool_id = pool.id(), "Health check failed, recovering pool");
            self.recover().await;
        }
    }

    fn cleanup_registry(&self) -> usize {
        let cap = self.config.max_connections as usize * 2;
        self.registry
            .cleanup(Utc::now(), self.tuning.registry_stale_after, cap)
    }

    async fn wait_for_recovery(&self) {
        if !self.recovery.is_recovering() {
            return;
        }
        debug!("Pool recovery in progress, waiting");
        let deadline = Instant::now() + self.tuning.recovery_wait;
        while self.recovery.is_recovering() && Instant::now() < deadline {
            tokio::time::sleep(RECOVERY_POLL).await;
        }
        if self.recovery.is_recovering() {
            warn!("Pool recovery is taking too long, proceeding anyway");
        }
    }

    /// A parked connection is reused only if it still belongs to the pool in
    /// service and answers a ping.
    async fn take_parked(&self, session: &str) -> Option<Connection> {
        let mut conn = self.sessions.take(session)?;
        let current = self.live_pool().map(|pool| pool.id());
        if current == Some(conn.pool_id()) && conn.ping().await {
            self.registry
                .register(conn.id(), session, conn.activity(), Utc::now());
            debug!(session, conn_id = %conn.id(), "Reusing parked connection");
            return Some(conn);
        }

        debug!(session, conn_id = %conn.id(), "Parked connection is no longer usable");
        self.registry.close(conn.id(), Utc::now());
        conn.discard().await;
        None
    }

    #[instrument(skip(self, wait))]
    async fn acquire(&self, session: &str, wait: Duration) -> DbResult<Connection> {
        if self.state() == PoolState::Closed {
            return Err(DatabaseError::PoolClosed);
        }

        if self.sessions.is_cacheable(session)
            && let Some(conn) = self.take_parked(session).await
        {
            return Ok(conn);
        }

        let wait_ms = wait.as_millis() as u64;
        let _admission = match timeout(wait, self.admission.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::PoolClosed),
            Err(_) => {
                self.metrics.record_error(
                    ErrorKind::AcquisitionTimeout,
                    format!("Too many concurrent acquisitions; session {} gave up", session),
                );
                return Err(DatabaseError::AcquisitionTimeout(wait_ms));
            }
        };

        self.wait_for_recovery().await;

        let pool = match self.live_pool() {
            Some(pool) => pool,
            None => {
                warn!("Connection pool is not available, attempting recovery");
                self.recover().await;
                self.live_pool().ok_or_else(|| self.unavailable())?
            }
        };

        let conn = match pool.acquire(wait).await {
            Ok(conn) => conn,
            Err(DatabaseError::AcquisitionTimeout(ms)) => {
                self.metrics.record_error(
                    ErrorKind::AcquisitionTimeout,
                    format!("Connection acquisition timed out for session {}", session),
                );
                if pool.is_exhausted() {
                    return Err(DatabaseError::AcquisitionTimeout(ms));
                }

                warn!("Acquisition timed out with free capacity, recovering pool");
                self.recover().await;
                let Some(pool) = self.live_pool() else {
                    return Err(DatabaseError::PoolUnavailable(
                        "connection acquisition timed out and recovery failed".into(),
                    ));
                };
                pool.acquire(self.tuning.acquire_retry_timeout).await?
            }
            Err(e) => {
                self.metrics.record_error(
                    ErrorKind::ConnectionError,
                    format!("Failed to get connection for session {}: {}", session, e),
                );
                return Err(e);
            }
        };

        self.registry
            .register(conn.id(), session, conn.activity(), Utc::now());
        debug!(conn_id = %conn.id(), "Acquired connection");
        Ok(conn)
    }

    fn unavailable(&self) -> DatabaseError {
        self.metrics.record_error(
            ErrorKind::PoolUnavailable,
            "Connection pool is not available and recovery failed",
        );
        DatabaseError::PoolUnavailable("recovery failed".into())
    }

    async fn release(&self, session: &str, conn: Connection) {
        let parkable = self.sessions.is_cacheable(session)
            && conn.is_healthy()
            && self.state() != PoolState::Closed
            && self
                .live_pool()
                .is_some_and(|pool| pool.id() == conn.pool_id());

        if parkable {
            debug!(session, conn_id = %conn.id(), "Parking connection");
            if let Some(displaced) = self.sessions.park(session, conn) {
                self.return_to_pool(displaced).await;
            }
            return;
        }

        self.return_to_pool(conn).await;
    }

    async fn return_to_pool(&self, conn: Connection) {
        let id = conn.id().to_string();
        let outcome = match self.current_pool() {
            Some(pool) => pool.release(conn).await,
            None => {
                conn.discard().await;
                ReleaseOutcome::Discarded("no pool")
            }
        };

        let now = Utc::now();
        match outcome {
            ReleaseOutcome::Returned => {
                self.registry.release(&id, now);
            }
            ReleaseOutcome::Discarded(reason) => {
                self.registry.close(&id, now);
                if reason == "transport closed" && self.state() != PoolState::Closed {
                    self.metrics.record_error(
                        ErrorKind::ConnectionError,
                        format!("Connection {} was closed while checked out", id),
                    );
                }
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == PoolState::Closed {
                return;
            }
            *state = PoolState::Closed;
        }
        self.monitor.stop();

        let now = Utc::now();
        for (_, conn) in self.sessions.drain() {
            self.registry.close(conn.id(), now);
            conn.discard().await;
        }

        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            if timeout(self.tuning.recovery_close_timeout, pool.wait_closed())
                .await
                .is_err()
            {
                warn!("Checked-out connections did not return before shutdown");
            }
        }
        self.registry.close_all();
        info!("Connection manager closed");
    }
}

#[async_trait]
impl Recoverable for ManagerInner {
    type Pool = ConnectionPool;

    fn detach(&self) -> Option<ConnectionPool> {
        let pool = self.pool.write().take();
        if pool.is_some() {
            self.registry.close_all();
            let mut state = self.state.write();
            if *state != PoolState::Closed {
                *state = PoolState::Degraded;
            }
        }
        pool
    }

    async fn shutdown(&self, pool: ConnectionPool) {
        pool.close().await;
        for (session, conn) in self.sessions.drain() {
            debug!(session = %session, conn_id = %conn.id(), "Dropping parked connection");
            conn.discard().await;
        }
        pool.wait_closed().await;
    }

    async fn create(&self) -> DbResult<ConnectionPool> {
        self.factory.create().await
    }

    async fn validate(&self, pool: &ConnectionPool) -> bool {
        health::probe(pool, &self.tuning, &self.metrics).await
    }

    fn attach(&self, pool: ConnectionPool) {
        {
            let mut state = self.state.write();
            if *state == PoolState::Closed {
                drop(state);
                tokio::spawn(async move { pool.close().await });
                return;
            }
            *state = PoolState::Ready;
        }
        *self.pool.write() = Some(pool);
        self.ensure_background();
    }

    async fn warm_up(&self) {
        let Some(pool) = self.live_pool() else {
            return;
        };
        let count = self
            .tuning
            .warmup_size
            .min(self.config.max_connections as usize);
        pool::warm_up(&pool, count, self.tuning.warmup_acquire_timeout).await;
    }
}
