//! Per-day call counters for protocol methods and tools, persisted as JSON.

use crate::error::Result;
use chrono::{Local, NaiveDate, TimeDelta};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Days of history kept.
pub const RETENTION_DAYS: i64 = 90;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// `date -> method -> count`, dates as `YYYY-MM-DD`.
pub type DailyCounts = BTreeMap<String, BTreeMap<String, u64>>;

/// Call statistics with a file-backed lifecycle: `load`, `record`, `flush`,
/// `close`.
pub struct CallStats {
    path: PathBuf,
    counts: Mutex<DailyCounts>,
}

impl CallStats {
    /// Reads `path` if it exists. An unreadable or corrupt file is logged and
    /// treated as empty so statistics never keep the server from starting.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let counts = match read_counts(&path) {
            Ok(counts) => counts,
            Err(e) => {
                warn!(path = %path.display(), "Failed to load call stats: {}", e);
                DailyCounts::new()
            }
        };

        let stats = Self {
            path,
            counts: Mutex::new(counts),
        };
        stats.prune(today());
        stats
    }

    /// Statistics that are never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            counts: Mutex::new(DailyCounts::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, method: &str) {
        self.record_on(today(), method);
    }

    pub fn record_on(&self, date: NaiveDate, method: &str) {
        {
            let mut counts = self.counts.lock();
            *counts
                .entry(date.format(DATE_FORMAT).to_string())
                .or_default()
                .entry(method.to_string())
                .or_insert(0) += 1;
        }
        self.prune(date);
    }

    /// Drops days older than [`RETENTION_DAYS`] before `today`.
    fn prune(&self, today: NaiveDate) {
        let cutoff = (today - TimeDelta::days(RETENTION_DAYS))
            .format(DATE_FORMAT)
            .to_string();
        let mut counts = self.counts.lock();
        let before = counts.len();
        counts.retain(|date, _| date.as_str() >= cutoff.as_str());
        if counts.len() < before {
            debug!(removed = before - counts.len(), "Pruned old call stats");
        }
    }

    pub fn daily(&self, date: &str) -> BTreeMap<String, u64> {
        self.counts.lock().get(date).cloned().unwrap_or_default()
    }

    pub fn daily_total(&self, date: &str) -> u64 {
        self.counts
            .lock()
            .get(date)
            .map_or(0, |methods| methods.values().sum())
    }

    pub fn method_total(&self, method: &str) -> u64 {
        self.counts
            .lock()
            .values()
            .filter_map(|methods| methods.get(method))
            .sum()
    }

    pub fn all(&self) -> DailyCounts {
        self.counts.lock().clone()
    }

    /// Writes the counters to disk, creating the parent directory.
    ///
    /// # Errors
    ///
    /// IO and serialization failures.
    pub fn flush(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&*self.counts.lock())?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), "Flushed call stats");
        Ok(())
    }

    /// Final flush; failures are logged, not returned.
    pub fn close(&self) {
        match self.flush() {
            Ok(()) => info!(path = %self.path.display(), "Call stats saved"),
            Err(e) => warn!(path = %self.path.display(), "Failed to save call stats: {}", e),
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn read_counts(path: &Path) -> Result<DailyCounts> {
    if !path.exists() {
        return Ok(DailyCounts::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_counters() {
        let stats = CallStats::in_memory();
        stats.record_on(day("2026-10-14"), "tools/call");
        stats.record_on(day("2026-10-15"), "tools/call");
        stats.record_on(day("2026-10-15"), "tools/call");
        stats.record_on(day("2026-10-15"), "exec_query");

        assert_eq!(stats.daily("2026-10-15").get("tools/call"), Some(&2));
        assert_eq!(stats.daily_total("2026-10-15"), 3);
        assert_eq!(stats.daily_total("2026-01-01"), 0);
        assert_eq!(stats.method_total("tools/call"), 3);
        assert_eq!(stats.all().len(), 2);
    }

    #[test]
    fn test_old_days_are_pruned() {
        let stats = CallStats::in_memory();
        stats.record_on(day("2026-01-01"), "tools/list");
        stats.record_on(day("2026-03-31"), "tools/list");
        assert_eq!(stats.all().len(), 2);

        stats.record_on(day("2026-04-02"), "tools/list");
        let all = stats.all();
        assert!(!all.contains_key("2026-01-01"));
        assert!(all.contains_key("2026-03-31"));
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("mcp_call_stats.json");

        let stats = CallStats::load(&path);
        stats.record("tools/list");
        stats.record("exec_query");
        stats.flush().unwrap();

        let reloaded = CallStats::load(&path);
        assert_eq!(reloaded.method_total("tools/list"), 1);
        assert_eq!(reloaded.method_total("exec_query"), 1);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        fs::write(&path, "{not json").unwrap();

        let stats = CallStats::load(&path);
        assert!(stats.all().is_empty());
        stats.record("tools/list");
        stats.close();
        assert!(fs::read_to_string(&path).unwrap().contains("tools/list"));
    }
}
