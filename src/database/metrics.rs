//! Pool metrics, error log and diagnosis reports.

use crate::database::pool::PoolStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::error;

/// Entries kept in the error ring buffer.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Classification used by [`Metrics::record_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AcquisitionTimeout,
    QueryTimeout,
    ValidationError,
    QueryError,
    ConnectionError,
    PoolUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquisitionTimeout => "acquisition_timeout",
            Self::QueryTimeout => "query_timeout",
            Self::ValidationError => "validation_error",
            Self::QueryError => "query_error",
            Self::ConnectionError => "connection_error",
            Self::PoolUnavailable => "pool_unavailable",
        }
    }

    /// Kinds without a dedicated counter.
    pub fn is_generic(&self) -> bool {
        !matches!(
            self,
            Self::AcquisitionTimeout | Self::QueryTimeout | Self::ValidationError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub connection_errors: u64,
    pub acquisition_timeouts: u64,
    pub query_timeouts: u64,
    pub validation_errors: u64,
    /// Mean dial time in milliseconds.
    pub avg_connection_time: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: MetricsSnapshot,
    errors: VecDeque<ErrorEntry>,
}

/// Shared counters plus the bounded error log.
///
/// One lock covers both so a snapshot never shows a counter without its
/// log entry.
#[derive(Debug, Default)]
pub struct Metrics {
    state: Mutex<MetricsState>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            let counters = &mut state.counters;
            match kind {
                ErrorKind::AcquisitionTimeout => counters.acquisition_timeouts += 1,
                ErrorKind::QueryTimeout => counters.query_timeouts += 1,
                ErrorKind::ValidationError => counters.validation_errors += 1,
                _ => {
                    counters.connection_errors += 1;
                    counters.failed_connections += 1;
                }
            }
            counters.last_error_time = Some(now);

            if state.errors.len() == ERROR_LOG_CAPACITY {
                state.errors.pop_front();
            }
            state.errors.push_back(ErrorEntry {
                timestamp: now,
                kind,
                message: message.clone(),
            });
        }
        error!(error_type = %kind, "{}", message);
    }

    /// Folds one successful dial into the running average.
    pub fn record_connection_created(&self, dial_time: Duration) {
        let mut state = self.state.lock();
        let counters = &mut state.counters;
        let millis = dial_time.as_secs_f64() * 1000.0;
        let created = counters.total_connections as f64;
        counters.avg_connection_time = (counters.avg_connection_time * created + millis) / (created + 1.0);
        counters.total_connections += 1;
    }

    pub fn record_health_check(&self, at: DateTime<Utc>) {
        self.state.lock().counters.last_health_check = Some(at);
    }

    pub fn set_connection_counts(&self, active: usize, idle: usize) {
        let mut state = self.state.lock();
        state.counters.active_connections = active;
        state.counters.idle_connections = idle;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().counters.clone()
    }

    /// Most recent entries, newest last.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEntry> {
        let state = self.state.lock();
        let skip = state.errors.len().saturating_sub(limit);
        state.errors.iter().skip(skip).cloned().collect()
    }

    pub fn error_count(&self) -> usize {
        self.state.lock().errors.len()
    }

    /// Occurrences per kind in the current error log.
    pub fn error_types(&self) -> BTreeMap<ErrorKind, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for entry in &state.errors {
            *counts.entry(entry.kind).or_insert(0) += 1;
        }
        counts
    }
}

/// Pool portion of a diagnosis.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub size: usize,
    pub free_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Percentage of slots checked out.
    pub utilization: f64,
}

impl PoolInfo {
    pub fn from_status(status: &PoolStatus) -> Self {
        let utilization = if status.max_size == 0 {
            0.0
        } else {
            let busy = status.size.saturating_sub(status.free_size) as f64;
            (busy / status.max_size as f64 * 1000.0).round() / 10.0
        };
        Self {
            size: status.size,
            free_size: status.free_size,
            min_size: status.min_size,
            max_size: status.max_size,
            utilization,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_size == 0 && self.size >= self.max_size
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorAnalysis {
    pub error_count: usize,
    pub last_error_time: Option<DateTime<Utc>>,
    pub error_types: BTreeMap<ErrorKind, usize>,
    pub recent_errors: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisReport {
    pub timestamp: DateTime<Utc>,
    pub pool_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_info: Option<PoolInfo>,
    pub pool_health: bool,
    pub metrics: MetricsSnapshot,
    pub recommendations: Vec<String>,
    pub error_analysis: ErrorAnalysis,
}

/// Builds the diagnosis from a pool status (absent when no pool exists) and
/// the outcome of a fresh health probe.
pub fn diagnose(pool: Option<&PoolStatus>, probe_ok: bool, metrics: &Metrics) -> DiagnosisReport {
    let snapshot = metrics.snapshot();
    let error_types = metrics.error_types();
    let error_count = metrics.error_count();
    let mut recommendations = Vec::new();

    let pool_status = match pool {
        None => "not_initialized",
        Some(status) if status.closed => "closed",
        Some(_) if probe_ok && error_count == 0 => "healthy",
        Some(_) if probe_ok => "warning",
        Some(_) => "unhealthy",
    };

    let pool_info = pool.map(PoolInfo::from_status);
    if let Some(info) = &pool_info {
        if info.is_exhausted() {
            recommendations
                .push("Connection pool is exhausted; consider increasing max_connections".into());
        }
        if info.utilization > 90.0 {
            recommendations.push(format!(
                "High pool utilization ({:.1}%); consider increasing pool size",
                info.utilization
            ));
        } else if info.utilization > 75.0 {
            recommendations.push(format!(
                "Moderate pool utilization ({:.1}%); monitor for growth",
                info.utilization
            ));
        }
    } else {
        recommendations.push("Connection pool is not initialized".into());
    }

    if pool.is_some_and(|s| !s.closed) && !probe_ok {
        recommendations
            .push("Health probe failed; check backend connectivity or recreate the pool".into());
    }
    if snapshot.acquisition_timeouts > 0 {
        recommendations.push(format!(
            "{} acquisition timeouts observed; connections may be held too long",
            snapshot.acquisition_timeouts
        ));
    }
    if snapshot.query_timeouts > 0 {
        recommendations.push(format!(
            "{} query timeouts observed; review slow queries",
            snapshot.query_timeouts
        ));
    }
    if snapshot.validation_errors > 0 {
        recommendations.push(format!(
            "{} validation errors observed; backend returned unexpected probe results",
            snapshot.validation_errors
        ));
    }
    if snapshot.connection_errors > 3 {
        recommendations.push(format!(
            "{} connection errors observed; check network stability",
            snapshot.connection_errors
        ));
    }

    DiagnosisReport {
        timestamp: Utc::now(),
        pool_status,
        pool_info,
        pool_health: probe_ok,
        metrics: snapshot.clone(),
        recommendations,
        error_analysis: ErrorAnalysis {
            error_count,
            last_error_time: snapshot.last_error_time,
            error_types,
            recent_errors: metrics.recent_errors(5),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub status: &'static str,
    /// Checked-out share of `max_size`, 0.0 to 1.0.
    pub utilization: f64,
    pub error_count: usize,
    pub metrics: MetricsSnapshot,
    pub recommendations: Vec<String>,
}

/// Lightweight report that needs no probe.
pub fn health_report(pool: Option<&PoolStatus>, metrics: &Metrics) -> HealthReport {
    let error_count = metrics.error_count();
    let mut recommendations = Vec::new();

    let (status, utilization) = match pool {
        None => ("not_initialized", 0.0),
        Some(status) if status.closed => ("closed", 0.0),
        Some(status) => {
            let busy = status.size.saturating_sub(status.free_size) as f64;
            let utilization = if status.max_size == 0 {
                0.0
            } else {
                busy / status.max_size as f64
            };
            if utilization > 0.9 {
                recommendations.push("Pool utilization above 90%".to_string());
            }
            if status.free_size == 0 {
                recommendations.push("No free connections available".to_string());
            }
            ("ready", utilization)
        }
    };

    if error_count > 10 {
        recommendations.push(format!("{} errors in the recent error log", error_count));
    }

    HealthReport {
        timestamp: Utc::now(),
        status,
        utilization,
        error_count,
        metrics: metrics.snapshot(),
        recommendations,
    }
}
