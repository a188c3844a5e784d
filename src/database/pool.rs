//! Bounded connection pool with a free list, slot lease and recycling.

use crate::config::{DatabaseConfig, PoolTuning};
use crate::database::connection::{Connection, is_probe_answer};
use crate::database::metrics::Metrics;
use crate::database::traits::{Backend, RawOutcome};
use crate::error::{DatabaseError, DbResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing and timing for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    /// Idle connections older than this are closed instead of reused.
    pub recycle: Duration,
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &DatabaseConfig, tuning: &PoolTuning) -> Self {
        Self {
            min_size: config.min_connections as usize,
            max_size: config.max_connections as usize,
            recycle: config.max_connection_age,
            connect_timeout: config.connection_timeout,
            ping_timeout: tuning.ping_timeout,
        }
    }
}

/// Counts read under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub free_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub closed: bool,
}

impl PoolStatus {
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.free_size)
    }
}

/// What [`ConnectionPool::release`] did with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Returned,
    Discarded(&'static str),
}

#[derive(Default)]
struct PoolInner {
    free: VecDeque<Connection>,
    /// Idle, checked-out and currently dialing connections.
    size: usize,
    closed: bool,
}

struct PoolShared {
    id: u64,
    backend: Arc<dyn Backend>,
    config: DatabaseConfig,
    settings: PoolSettings,
    metrics: Arc<Metrics>,
    ids: Arc<AtomicU64>,
    slots: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    drained: Notify,
}

impl PoolShared {
    fn shrink(&self, by: usize) {
        let mut inner = self.inner.lock();
        inner.size = inner.size.saturating_sub(by);
        if inner.closed && inner.size == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// A checked-out connection's claim on its pool: one size unit plus one slot.
///
/// Dropping an unsettled lease gives both back.
pub(crate) struct Lease {
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
    settled: bool,
}

impl Lease {
    fn belongs_to(&self, shared: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    /// The connection went back on the free list and keeps its size unit.
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.shrink(1);
        }
    }
}

/// Holds a size unit while a dial is in flight.
struct Reservation {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl Reservation {
    fn keep(mut self) {
        self.armed = false;
    }

    fn commit(mut self, permit: OwnedSemaphorePermit) -> Lease {
        self.armed = false;
        Lease {
            shared: Arc::clone(&self.shared),
            _permit: permit,
            settled: false,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.shrink(1);
        }
    }
}

/// Builds pools sharing one backend, config and id counter.
#[derive(Clone)]
pub struct PoolFactory {
    backend: Arc<dyn Backend>,
    config: DatabaseConfig,
    settings: PoolSettings,
    metrics: Arc<Metrics>,
    ids: Arc<AtomicU64>,
}

impl PoolFactory {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: DatabaseConfig,
        settings: PoolSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            config,
            settings,
            metrics,
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Dials one connection outside any pool, runs `SELECT 1` and closes it.
    #[instrument(skip(self), fields(backend = self.backend.name(), endpoint = %self.config.endpoint()))]
    pub async fn check_connectivity(&self, limit: Duration) -> DbResult<()> {
        let attempt = async {
            let mut raw = self.backend.dial(&self.config).await?;
            let outcome = raw.query("SELECT 1", &[], true).await;
            if let Err(e) = raw.close().await {
                debug!("Error closing connectivity probe: {}", e);
            }
            match outcome? {
                RawOutcome::Rows { rows, .. }
                    if rows
                        .first()
                        .is_some_and(|row| is_probe_answer(row.first())) =>
                {
                    Ok(())
                }
                _ => Err(DatabaseError::ConnectionFailed(
                    "Connectivity probe returned an unexpected result".into(),
                )),
            }
        };

        match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::ConnectionFailed(format!(
                "Connectivity test timed out after {}s",
                limit.as_secs()
            ))),
        }
    }

    /// Allocates a pool and dials `min_size` connections into it.
    pub async fn create(&self) -> DbResult<ConnectionPool> {
        let pool = ConnectionPool {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                backend: Arc::clone(&self.backend),
                config: self.config.clone(),
                settings: self.settings.clone(),
                metrics: Arc::clone(&self.metrics),
                ids: Arc::clone(&self.ids),
                slots: Arc::new(Semaphore::new(self.settings.max_size)),
                inner: Mutex::new(PoolInner::default()),
                drained: Notify::new(),
            }),
        };

        if let Err(e) = pool.fill().await {
            pool.close().await;
            return Err(e);
        }

        info!(
            pool_id = pool.id(),
            min_size = self.settings.min_size,
            max_size = self.settings.max_size,
            "Connection pool created"
        );
        Ok(pool)
    }
}

/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock();
        PoolStatus {
            size: inner.size,
            free_size: inner.free.len(),
            min_size: self.shared.settings.min_size,
            max_size: self.shared.settings.max_size,
            closed: inner.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Every slot is checked out and nothing is idle.
    pub fn is_exhausted(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.free.is_empty() && inner.size >= self.shared.settings.max_size
    }

    async fn fill(&self) -> DbResult<()> {
        for _ in 0..self.shared.settings.min_size {
            let reservation = self.reserve().ok_or(DatabaseError::PoolClosed)?;
            let conn = self.dial(self.shared.settings.connect_timeout).await?;
            self.shared.inner.lock().free.push_back(conn);
            // The idle connection now owns the size unit.
            reservation.keep();
        }
        Ok(())
    }

    fn reserve(&self) -> Option<Reservation> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return None;
        }
        inner.size += 1;
        Some(Reservation {
            shared: Arc::clone(&self.shared),
            armed: true,
        })
    }

    async fn dial(&self, limit: Duration) -> DbResult<Connection> {
        let shared = &self.shared;
        let started = Instant::now();
        let raw = match timeout(limit, shared.backend.dial(&shared.config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DatabaseError::ConnectionFailed(format!(
                    "Connection attempt timed out after {}ms",
                    limit.as_millis()
                )));
            }
        };
        shared.metrics.record_connection_created(started.elapsed());

        let id = match raw.thread_id() {
            Some(thread_id) => format!("conn_{}", thread_id),
            None => format!("conn_{}", shared.ids.fetch_add(1, Ordering::Relaxed)),
        };
        debug!(pool_id = shared.id, conn_id = %id, "Opened connection");
        Ok(Connection::new(
            id,
            shared.id,
            raw,
            shared.settings.ping_timeout,
        ))
    }

    /// Pops reusable idle connections; aged or closed ones come back in the
    /// second list with their size units already released.
    fn take_idle(&self) -> (Option<Connection>, Vec<Connection>) {
        let recycle = self.shared.settings.recycle;
        let mut inner = self.shared.inner.lock();
        let mut stale = Vec::new();
        while let Some(conn) = inner.free.pop_front() {
            if conn.is_closed() || conn.age() >= recycle {
                inner.size = inner.size.saturating_sub(1);
                stale.push(conn);
                continue;
            }
            return (Some(conn), stale);
        }
        (None, stale)
    }

    /// Waits up to `wait` for a slot, then hands out an idle connection or
    /// dials a new one.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::AcquisitionTimeout`] when no slot frees up in time
    ///   or the dial is still pending when `wait` runs out
    /// - [`DatabaseError::PoolClosed`] once the pool is closed
    /// - the backend's dial error otherwise
    #[instrument(skip(self), fields(pool_id = self.shared.id))]
    pub async fn acquire(&self, wait: Duration) -> DbResult<Connection> {
        let shared = &self.shared;
        if self.is_closed() {
            return Err(DatabaseError::PoolClosed);
        }

        let started = Instant::now();
        let waited_ms = wait.as_millis() as u64;
        let permit = match timeout(wait, Arc::clone(&shared.slots).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::PoolClosed),
            Err(_) => return Err(DatabaseError::AcquisitionTimeout(waited_ms)),
        };

        let (idle, stale) = self.take_idle();
        if let Some(mut conn) = idle {
            conn.lease = Some(Lease {
                shared: Arc::clone(shared),
                _permit: permit,
                settled: false,
            });
            close_all(stale).await;
            return Ok(conn);
        }
        close_all(stale).await;

        let reservation = self.reserve().ok_or(DatabaseError::PoolClosed)?;
        let remaining = wait.saturating_sub(started.elapsed());
        let dial = if remaining < shared.settings.connect_timeout {
            match timeout(remaining, self.dial(shared.settings.connect_timeout)).await {
                Ok(result) => result,
                Err(_) => Err(DatabaseError::AcquisitionTimeout(waited_ms)),
            }
        } else {
            self.dial(shared.settings.connect_timeout).await
        };

        let mut conn = dial?;
        conn.lease = Some(reservation.commit(permit));
        Ok(conn)
    }

    /// Hands a connection back.
    ///
    /// Closed, unhealthy or foreign connections and anything released into
    /// a closed pool are discarded rather than reused.
    pub async fn release(&self, mut conn: Connection) -> ReleaseOutcome {
        let reason = match conn.lease.as_ref() {
            None => Some("not checked out"),
            Some(_) if conn.is_closed() => Some("transport closed"),
            Some(_) if !conn.is_healthy() => Some("unhealthy"),
            Some(lease) if !lease.belongs_to(&self.shared) => Some("stale pool"),
            Some(_) => None,
        };

        let reason = match reason {
            Some(reason) => reason,
            None => {
                let mut inner = self.shared.inner.lock();
                if inner.closed {
                    "pool closed"
                } else {
                    let lease = conn.lease.take();
                    inner.free.push_back(conn);
                    drop(inner);
                    if let Some(lease) = lease {
                        lease.settle();
                    }
                    return ReleaseOutcome::Returned;
                }
            }
        };

        debug!(pool_id = self.shared.id, conn_id = %conn.id(), reason, "Discarding connection");
        conn.discard().await;
        ReleaseOutcome::Discarded(reason)
    }

    /// Marks the pool closed, refuses new acquisitions and closes idle
    /// connections. Checked-out connections are closed as they come back.
    pub async fn close(&self) {
        let idle: Vec<Connection> = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let idle: Vec<Connection> = inner.free.drain(..).collect();
            inner.size = inner.size.saturating_sub(idle.len());
            idle
        };
        self.shared.slots.close();

        let closing = idle.len();
        close_all(idle).await;
        self.shared.shrink(0);
        info!(pool_id = self.shared.id, closing, "Connection pool closed");
    }

    /// Resolves once every connection of a closed pool is gone.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.shared.inner.lock();
                if inner.closed && inner.size == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

async fn close_all(connections: Vec<Connection>) {
    for mut conn in connections {
        conn.close().await;
    }
}

/// Acquires `count` connections at once and hands them back, leaving them
/// idle. Stops at the first failure and returns how many were opened.
pub async fn warm_up(pool: &ConnectionPool, count: usize, per_acquire: Duration) -> usize {
    let mut held = Vec::with_capacity(count);
    for _ in 0..count {
        match pool.acquire(per_acquire).await {
            Ok(conn) => held.push(conn),
            Err(e) => {
                warn!(pool_id = pool.id(), "Warm-up stopped early: {}", e);
                break;
            }
        }
    }

    let warmed = held.len();
    for conn in held {
        pool.release(conn).await;
    }
    debug!(pool_id = pool.id(), warmed, "Pool warm-up finished");
    warmed
}
