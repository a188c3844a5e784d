//! Database access layer.
//!
//! A self-healing connection pool in front of a MySQL-protocol backend
//! (Apache Doris FE). [`ConnectionManager`] is the entry point: it hands out
//! [`Connection`]s, watches pool health in the background and rebuilds the
//! pool when it fails.
//!
//! # Feature Flags
//!
//! - `mysql` - Enable the MySQL wire-protocol backend (enabled by default)
//!
//! Without `mysql` the layer still builds; callers supply their own
//! [`Backend`].

pub mod connection;
pub mod health;
pub mod manager;
pub mod metrics;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod result;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;

pub use connection::{Connection, ConnectionActivity};
pub use manager::{ConnectionManager, ManagerStatus, PoolState};
pub use metrics::{DiagnosisReport, ErrorKind, HealthReport, Metrics, MetricsSnapshot};
#[cfg(feature = "mysql")]
pub use mysql::MysqlBackend;
pub use pool::{ConnectionPool, PoolStatus};
pub use recovery::RecoveryOutcome;
pub use registry::{ConnectionInfo, ConnectionStatus};
pub use result::*;
pub use session::{SYSTEM_SESSIONS, is_system_session};
pub use traits::{Backend, RawConnection, RawOutcome};
