//! A checked-out backend connection and its activity record.

use crate::database::pool::Lease;
use crate::database::result::{CellValue, QueryResult, Row};
use crate::database::traits::{RawConnection, RawOutcome};
use crate::error::{DatabaseError, DbResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::debug;

/// Statement prefixes that produce a result set.
const ROW_RETURNING: [&str; 6] = ["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];

/// Mutable per-connection bookkeeping, shared with the registry so it can
/// report live values without touching the connection itself.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionActivity {
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub query_count: u64,
    pub last_sql: Option<String>,
    pub healthy: bool,
}

impl ConnectionActivity {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_used: now,
            query_count: 0,
            last_sql: None,
            healthy: true,
        }
    }
}

pub type SharedActivity = Arc<Mutex<ConnectionActivity>>;

/// True when `sql` is answered with rows rather than an affected-row count.
pub fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start();
    let head = head
        .get(..head.len().min(8))
        .unwrap_or(head)
        .to_ascii_uppercase();
    ROW_RETURNING.iter().any(|prefix| head.starts_with(prefix))
}

/// Accepts the `SELECT 1` answer however the driver typed it.
pub(crate) fn is_probe_answer(value: Option<&CellValue>) -> bool {
    match value {
        Some(CellValue::Int(1)) => true,
        Some(CellValue::String(s)) => s.trim() == "1",
        _ => false,
    }
}

/// One physical connection owned by exactly one holder.
///
/// While checked out it carries a pool [`Lease`]; dropping the connection
/// without handing it back gives the slot back and forgets the transport.
pub struct Connection {
    id: String,
    pool_id: u64,
    raw: Option<Box<dyn RawConnection>>,
    born: Instant,
    ping_timeout: Duration,
    activity: SharedActivity,
    pub(crate) lease: Option<Lease>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: String,
        pool_id: u64,
        raw: Box<dyn RawConnection>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            id,
            pool_id,
            raw: Some(raw),
            born: Instant::now(),
            ping_timeout,
            activity: Arc::new(Mutex::new(ConnectionActivity::new())),
            lease: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the pool that dialed this connection.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }

    pub fn activity(&self) -> SharedActivity {
        Arc::clone(&self.activity)
    }

    pub fn snapshot(&self) -> ConnectionActivity {
        self.activity.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.raw.as_ref().is_none_or(|raw| raw.is_closed())
    }

    pub fn is_healthy(&self) -> bool {
        self.activity.lock().healthy && !self.is_closed()
    }

    pub fn mark_unhealthy(&self) {
        self.activity.lock().healthy = false;
    }

    /// Runs one statement.
    ///
    /// Row-returning statements (see [`returns_rows`]) materialize their rows;
    /// everything else reports the affected-row count with empty `data`.
    /// Any failure marks the connection unhealthy.
    pub async fn execute(&mut self, sql: &str, params: &[CellValue]) -> DbResult<QueryResult> {
        {
            let mut activity = self.activity.lock();
            activity.last_used = Utc::now();
            activity.query_count += 1;
            activity.last_sql = Some(sql.to_string());
        }

        let Some(raw) = self.raw.as_mut() else {
            self.mark_unhealthy();
            return Err(DatabaseError::ConnectionClosed);
        };

        let started = Instant::now();
        let outcome = raw.query(sql, params, returns_rows(sql)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(RawOutcome::Rows { columns, rows }) => {
                let data = rows
                    .into_iter()
                    .map(|values| columns.iter().cloned().zip(values).collect::<Row>())
                    .collect();
                Ok(QueryResult::rows(columns, data, elapsed))
            }
            Ok(RawOutcome::Affected(count)) => Ok(QueryResult::affected(count, elapsed)),
            Err(e) => {
                debug!(conn_id = %self.id, "Statement failed: {}", e);
                self.mark_unhealthy();
                Err(e)
            }
        }
    }

    /// Bounded `SELECT 1`. Never errors; a failed ping leaves the connection
    /// marked unhealthy.
    pub async fn ping(&mut self) -> bool {
        if self.is_closed() {
            self.mark_unhealthy();
            return false;
        }

        let ok = match timeout(self.ping_timeout, self.execute("SELECT 1", &[])).await {
            Ok(Ok(result)) => is_probe_answer(result.scalar()),
            Ok(Err(_)) | Err(_) => false,
        };
        if !ok {
            self.mark_unhealthy();
        }
        ok
    }

    /// Closes the transport. Idempotent; transport errors are swallowed.
    pub async fn close(&mut self) {
        if let Some(mut raw) = self.raw.take()
            && let Err(e) = raw.close().await
        {
            debug!(conn_id = %self.id, "Error while closing connection: {}", e);
        }
    }

    /// Closes the transport and gives up the pool slot.
    pub(crate) async fn discard(mut self) {
        self.mark_unhealthy();
        self.close().await;
        // Dropping the lease here returns the slot to its own pool.
        self.lease.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::testing::ScriptedBackend;
    use crate::database::traits::Backend;

    async fn connect(backend: &ScriptedBackend) -> Connection {
        let raw = backend.dial(&DatabaseConfig::default()).await.unwrap();
        Connection::new("conn_test".into(), 1, raw, Duration::from_secs(3))
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  select * from t"));
        assert!(returns_rows("show tables"));
        assert!(returns_rows("DESC orders"));
        assert!(returns_rows("with x as (select 1) select * from x"));
        assert!(returns_rows("EXPLAIN SELECT 1"));
        assert!(!returns_rows("UPDATE t SET x=1"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows(""));
    }

    #[tokio::test]
    async fn test_execute_rows_and_affected() {
        let backend = ScriptedBackend::new();
        backend.set_affected_rows(4);
        let mut conn = connect(&backend).await;

        let result = conn.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.scalar(), Some(&CellValue::Int(1)));

        let result = conn.execute("UPDATE t SET x=1", &[]).await.unwrap();
        assert_eq!(result.row_count, 4);
        assert!(result.data.is_empty());

        let activity = conn.snapshot();
        assert_eq!(activity.query_count, 2);
        assert_eq!(activity.last_sql.as_deref(), Some("UPDATE t SET x=1"));
        assert!(activity.healthy);
    }

    #[tokio::test]
    async fn test_failure_marks_unhealthy() {
        let backend = ScriptedBackend::new();
        let mut conn = connect(&backend).await;
        backend.fail_queries(true);

        assert!(conn.execute("SELECT 1", &[]).await.is_err());
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_ping() {
        let backend = ScriptedBackend::new();
        let mut conn = connect(&backend).await;
        assert!(conn.ping().await);

        backend.set_probe_value(CellValue::Int(2));
        assert!(!conn.ping().await);
        assert!(!conn.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_times_out() {
        let backend = ScriptedBackend::new();
        let mut conn = connect(&backend).await;
        backend.set_query_delay(Some(Duration::from_secs(60)));

        assert!(!conn.ping().await);
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = ScriptedBackend::new();
        let mut conn = connect(&backend).await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(!conn.ping().await);
        assert!(matches!(
            conn.execute("SELECT 1", &[]).await,
            Err(DatabaseError::ConnectionClosed)
        ));
        assert_eq!(backend.open_connections(), 0);
    }
}
