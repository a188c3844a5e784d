//! Parks connections between calls for session keys that opt in.

use crate::config::SessionCacheConfig;
use crate::database::connection::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Internal callers share these keys; every other key is a user session.
pub const SYSTEM_SESSIONS: [&str; 2] = ["query", "system"];

pub fn is_system_session(key: &str) -> bool {
    SYSTEM_SESSIONS.contains(&key)
}

/// Connections held on behalf of a session key.
///
/// A parked connection stays checked out from the pool; taking it moves it
/// to exactly one caller.
pub struct SessionCache {
    config: SessionCacheConfig,
    parked: Mutex<HashMap<String, Connection>>,
}

impl SessionCache {
    pub fn new(config: SessionCacheConfig) -> Self {
        Self {
            config,
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_cacheable(&self, key: &str) -> bool {
        if is_system_session(key) {
            self.config.cache_system_sessions
        } else {
            self.config.cache_user_sessions
        }
    }

    /// Parks `conn` under `key`, handing back whatever was parked there.
    pub fn park(&self, key: &str, conn: Connection) -> Option<Connection> {
        self.parked.lock().insert(key.to_string(), conn)
    }

    pub fn take(&self, key: &str) -> Option<Connection> {
        self.parked.lock().remove(key)
    }

    pub fn drain(&self) -> Vec<(String, Connection)> {
        self.parked.lock().drain().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.parked.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.lock().is_empty()
    }
}
