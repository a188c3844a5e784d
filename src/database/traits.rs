//! Backend transport traits.

use crate::config::DatabaseConfig;
use crate::database::result::CellValue;
use crate::error::DbResult;
use async_trait::async_trait;

/// Dials physical connections to the backend.
///
/// Implementations: [`MysqlBackend`](crate::database::MysqlBackend) and the
/// scripted backend used by the test suite.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the backend name (e.g., "mysql").
    fn name(&self) -> &'static str;

    /// Opens one physical connection.
    ///
    /// Uses host, port, user, password, database and charset from `config`.
    /// Callers bound the call with `config.connection_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`](crate::error::DatabaseError::ConnectionFailed)
    /// if the backend is unreachable or rejects the credentials.
    async fn dial(&self, config: &DatabaseConfig) -> DbResult<Box<dyn RawConnection>>;
}

/// What a statement produced on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<CellValue>>,
    },
    Affected(u64),
}

/// One physical connection.
///
/// Not `Sync`: a raw connection is only ever driven by its current owner.
#[async_trait]
pub trait RawConnection: Send {
    /// Backend-assigned connection (thread) id, when the driver exposes one.
    fn thread_id(&self) -> Option<u64>;

    /// True once the transport is known to be gone.
    fn is_closed(&self) -> bool;

    /// Runs one statement.
    ///
    /// # Arguments
    ///
    /// * `sql` - Statement text
    /// * `params` - Positional parameters; empty runs the text as-is
    /// * `fetch_rows` - Materialize a result set instead of reporting affected rows
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::QueryFailed`](crate::error::DatabaseError::QueryFailed)
    /// for statement errors and
    /// [`DatabaseError::ConnectionClosed`](crate::error::DatabaseError::ConnectionClosed)
    /// once the transport is gone.
    async fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
        fetch_rows: bool,
    ) -> DbResult<RawOutcome>;

    /// Closes the transport. Safe to call more than once.
    async fn close(&mut self) -> DbResult<()>;
}
