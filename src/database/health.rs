//! Health probe and the background task handle that drives it.

use crate::config::PoolTuning;
use crate::database::connection::is_probe_answer;
use crate::database::metrics::{ErrorKind, Metrics};
use crate::database::pool::ConnectionPool;
use crate::error::DatabaseError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Acquire, `SELECT 1`, release. Every failure is recorded in `metrics`.
///
/// The probe connection is discarded when it failed and returned otherwise.
#[instrument(skip_all, fields(pool_id = pool.id()))]
pub async fn probe(pool: &ConnectionPool, tuning: &PoolTuning, metrics: &Metrics) -> bool {
    if pool.is_closed() {
        metrics.record_error(ErrorKind::PoolUnavailable, "Health probe found the pool closed");
        return false;
    }

    let mut conn = match pool.acquire(tuning.probe_acquire_timeout).await {
        Ok(conn) => conn,
        Err(DatabaseError::AcquisitionTimeout(ms)) => {
            metrics.record_error(
                ErrorKind::AcquisitionTimeout,
                format!("Health probe could not acquire a connection within {}ms", ms),
            );
            return false;
        }
        Err(e) => {
            metrics.record_error(
                ErrorKind::ConnectionError,
                format!("Health probe failed to acquire a connection: {}", e),
            );
            return false;
        }
    };

    let failure = match timeout(tuning.probe_query_timeout, conn.execute("SELECT 1", &[])).await {
        Err(_) => Some((
            ErrorKind::QueryTimeout,
            format!(
                "Health probe query timed out after {}ms",
                tuning.probe_query_timeout.as_millis()
            ),
        )),
        Ok(Err(e)) => Some((
            ErrorKind::QueryError,
            format!("Health probe query failed: {}", e),
        )),
        Ok(Ok(result)) if is_probe_answer(result.scalar()) => None,
        Ok(Ok(result)) => Some((
            ErrorKind::ValidationError,
            format!("Health probe returned unexpected result: {:?}", result.scalar()),
        )),
    };

    match failure {
        None => {
            pool.release(conn).await;
            true
        }
        Some((kind, message)) => {
            metrics.record_error(kind, message);
            conn.mark_unhealthy();
            pool.release(conn).await;
            false
        }
    }
}

/// Cleared when dropped.
pub struct ProbeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Background tasks of one manager plus the "probe in progress" flag.
#[derive(Default)]
pub struct HealthMonitor {
    probing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the probe slot, or `None` when another probe is running.
    pub fn try_begin(&self) -> Option<ProbeGuard<'_>> {
        self.probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProbeGuard {
                flag: &self.probing,
            })
    }

    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Runs `tick` every `interval` until it returns `None` or the monitor
    /// is stopped. The first tick happens one interval after spawning.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, interval: Duration, tick: F)
    where
        F: Fn() -> Option<Fut> + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match tick() {
                    Some(cycle) => cycle.await,
                    None => {
                        debug!(task = name, "Owner dropped, stopping background task");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Aborts every background task.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::pool::{PoolFactory, PoolSettings};
    use crate::database::result::CellValue;
    use crate::database::testing::ScriptedBackend;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    async fn pool_with(backend: &ScriptedBackend, max: u32, metrics: Arc<Metrics>) -> ConnectionPool {
        let config = DatabaseConfig::builder()
            .max_connections(max)
            .build_unchecked();
        let settings = PoolSettings::from_config(&config, &PoolTuning::default());
        PoolFactory::new(Arc::new(backend.clone()), config, settings, metrics)
            .create()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_probe_success_returns_connection() {
        let backend = ScriptedBackend::new();
        let metrics = Arc::new(Metrics::new());
        let pool = pool_with(&backend, 2, Arc::clone(&metrics)).await;

        assert!(probe(&pool, &PoolTuning::default(), &metrics).await);
        assert_eq!(pool.status().free_size, 1);
        assert_eq!(metrics.error_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_unexpected_value_is_validation_error() {
        let backend = ScriptedBackend::new();
        backend.set_probe_value(CellValue::Int(0));
        let metrics = Arc::new(Metrics::new());
        let pool = pool_with(&backend, 2, Arc::clone(&metrics)).await;

        assert!(!probe(&pool, &PoolTuning::default(), &metrics).await);
        assert_eq!(metrics.snapshot().validation_errors, 1);
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn test_probe_accepts_textual_one() {
        let backend = ScriptedBackend::new();
        backend.set_probe_value(CellValue::from("1"));
        let metrics = Arc::new(Metrics::new());
        let pool = pool_with(&backend, 2, Arc::clone(&metrics)).await;
        assert!(probe(&pool, &PoolTuning::default(), &metrics).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeouts_are_classified() {
        let backend = ScriptedBackend::new();
        let metrics = Arc::new(Metrics::new());
        let pool = pool_with(&backend, 1, Arc::clone(&metrics)).await;
        let tuning = PoolTuning::default();

        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(!probe(&pool, &tuning, &metrics).await);
        assert_eq!(metrics.snapshot().acquisition_timeouts, 1);
        pool.release(held).await;

        backend.set_query_delay(Some(Duration::from_secs(60)));
        assert!(!probe(&pool, &tuning, &metrics).await);
        assert_eq!(metrics.snapshot().query_timeouts, 1);
    }

    #[tokio::test]
    async fn test_probe_on_closed_pool() {
        let backend = ScriptedBackend::new();
        let metrics = Arc::new(Metrics::new());
        let pool = pool_with(&backend, 2, Arc::clone(&metrics)).await;
        pool.close().await;

        assert!(!probe(&pool, &PoolTuning::default(), &metrics).await);
        assert_eq!(metrics.snapshot().connection_errors, 1);
        assert_eq!(metrics.snapshot().failed_connections, 1);
    }

    #[test]
    fn test_probe_guard_is_exclusive() {
        let monitor = HealthMonitor::new();
        let guard = monitor.try_begin().unwrap();
        assert!(monitor.is_probing());
        assert!(monitor.try_begin().is_none());
        drop(guard);
        assert!(!monitor.is_probing());
        assert!(monitor.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_and_stops() {
        let monitor = HealthMonitor::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        monitor.spawn_periodic("test", Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            Some(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(monitor.is_running());

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_exits_when_owner_is_gone() {
        let monitor = HealthMonitor::new();
        monitor.spawn_periodic("test", Duration::from_secs(1), || None::<std::future::Ready<()>>);
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!monitor.is_running());
    }
}
