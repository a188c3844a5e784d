//! Bookkeeping for every connection handed out, independent of the pool's
//! own free list.

use crate::database::connection::SharedActivity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Idle,
    Closed,
}

struct RegistryEntry {
    session_id: Option<String>,
    status: ConnectionStatus,
    acquired_at: DateTime<Utc>,
    last_release_time: Option<DateTime<Utc>>,
    total_duration: Duration,
    release_count: u64,
    activity: SharedActivity,
}

impl RegistryEntry {
    fn last_touched(&self) -> DateTime<Utc> {
        self.last_release_time
            .map_or(self.acquired_at, |released| released.max(self.acquired_at))
    }
}

/// Registry entry merged with the connection's live activity.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub session_id: Option<String>,
    pub status: ConnectionStatus,
    pub acquired_at: DateTime<Utc>,
    pub last_release_time: Option<DateTime<Utc>>,
    /// Seconds spent checked out across all releases.
    pub total_duration: f64,
    pub release_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub query_count: u64,
    pub healthy: bool,
    pub last_sql: Option<String>,
}

/// Connection id to entry. The lock is never held across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a checkout. A closed entry under the same id belonged to an
    /// earlier physical connection and is replaced; an entry that is still
    /// active (a parked connection handed out again) keeps its held time.
    pub fn register(
        &self,
        connection_id: &str,
        session_id: &str,
        activity: SharedActivity,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .get_mut(connection_id)
            .filter(|entry| entry.status != ConnectionStatus::Closed)
        {
            if entry.status == ConnectionStatus::Active {
                entry.total_duration += (now - entry.acquired_at).to_std().unwrap_or_default();
            }
            entry.status = ConnectionStatus::Active;
            entry.session_id = Some(session_id.to_string());
            entry.acquired_at = now;
            entry.activity = activity;
            return;
        }

        entries.insert(
            connection_id.to_string(),
            RegistryEntry {
                session_id: Some(session_id.to_string()),
                status: ConnectionStatus::Active,
                acquired_at: now,
                last_release_time: None,
                total_duration: Duration::ZERO,
                release_count: 0,
                activity,
            },
        );
    }

    /// Flips an active entry to idle. Returns false (and changes nothing)
    /// unless the entry is active, so a repeated release is harmless.
    pub fn release(&self, connection_id: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(connection_id) else {
            return false;
        };
        if entry.status != ConnectionStatus::Active {
            return false;
        }

        let held = (now - entry.acquired_at).to_std().unwrap_or_default();
        entry.status = ConnectionStatus::Idle;
        entry.total_duration += held;
        entry.release_count += 1;
        entry.last_release_time = Some(now);
        entry.session_id = None;
        true
    }

    /// Marks the entry closed; a no-op for unknown ids.
    pub fn close(&self, connection_id: &str, now: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(connection_id) {
            if entry.status == ConnectionStatus::Active {
                let held = (now - entry.acquired_at).to_std().unwrap_or_default();
                entry.total_duration += held;
                entry.last_release_time = Some(now);
            }
            entry.status = ConnectionStatus::Closed;
            entry.session_id = None;
        }
    }

    /// Marks every entry closed, used when the pool is torn down.
    pub fn close_all(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.status = ConnectionStatus::Closed;
            entry.session_id = None;
        }
    }

    /// Drops closed entries, idle entries untouched for `stale_after`, and
    /// then the least recently touched entries beyond `cap`.
    pub fn cleanup(&self, now: DateTime<Utc>, stale_after: Duration, cap: usize) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();

        entries.retain(|_, entry| match entry.status {
            ConnectionStatus::Closed => false,
            ConnectionStatus::Idle => (now - entry.last_touched())
                .to_std()
                .map_or(true, |idle_for| idle_for < stale_after),
            ConnectionStatus::Active => true,
        });

        if entries.len() > cap {
            let mut by_age: Vec<(String, DateTime<Utc>)> = entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.last_touched()))
                .collect();
            by_age.sort_by_key(|(_, touched)| *touched);
            let excess = entries.len() - cap;
            for (id, _) in by_age.into_iter().take(excess) {
                entries.remove(&id);
            }
        }

        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Registry cleanup");
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.entries
            .lock()
            .get(connection_id)
            .map(|entry| info(connection_id, entry))
    }

    /// All entries, most recently acquired first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| info(id, entry))
            .collect();
        all.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        all
    }

    /// Session key to the connection it currently holds.
    pub fn sessions(&self) -> HashMap<String, ConnectionInfo> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.status == ConnectionStatus::Active)
            .filter_map(|(id, entry)| {
                entry
                    .session_id
                    .clone()
                    .map(|session| (session, info(id, entry)))
            })
            .collect()
    }

    /// `(active, idle)` entry counts.
    pub fn counts(&self) -> (usize, usize) {
        let entries = self.entries.lock();
        entries
            .values()
            .fold((0, 0), |(active, idle), entry| match entry.status {
                ConnectionStatus::Active => (active + 1, idle),
                ConnectionStatus::Idle => (active, idle + 1),
                ConnectionStatus::Closed => (active, idle),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn info(connection_id: &str, entry: &RegistryEntry) -> ConnectionInfo {
    let activity = entry.activity.lock();
    ConnectionInfo {
        connection_id: connection_id.to_string(),
        session_id: entry.session_id.clone(),
        status: entry.status,
        acquired_at: entry.acquired_at,
        last_release_time: entry.last_release_time,
        total_duration: entry.total_duration.as_secs_f64(),
        release_count: entry.release_count,
        created_at: activity.created_at,
        last_used: activity.last_used,
        query_count: activity.query_count,
        healthy: activity.healthy,
        last_sql: activity.last_sql.clone(),
    }
}
