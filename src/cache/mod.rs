//! Metadata cache with TTL-based expiration.

use crate::database::{ColumnSchema, TableInfo};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    TableSchema,
    DatabaseTables,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableSchema => "table_schema",
            Self::DatabaseTables => "database_tables",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table_schema" => Ok(Self::TableSchema),
            "database_tables" => Ok(Self::DatabaseTables),
            other => Err(format!(
                "Invalid cache type: {}. Use 'all', 'table_schema', or 'database_tables'",
                other
            )),
        }
    }
}

/// `name` is the table for schema entries and absent for table lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub db: String,
    pub name: Option<String>,
}

impl CacheKey {
    pub fn table_schema(db: &str, table: &str) -> Self {
        Self {
            kind: CacheKind::TableSchema,
            db: db.to_string(),
            name: Some(table.to_string()),
        }
    }

    pub fn database_tables(db: &str) -> Self {
        Self {
            kind: CacheKind::DatabaseTables,
            db: db.to_string(),
            name: None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}:{}", self.kind, self.db, name),
            None => write!(f, "{}:{}", self.kind, self.db),
        }
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Columns(Vec<ColumnSchema>),
    Tables(Vec<TableInfo>),
}

#[derive(Clone)]
struct CacheEntry {
    value: CachedValue,
    created_at: Instant,
}

impl CacheEntry {
    fn new(value: CachedValue) -> Self {
        Self {
            value,
            created_at: Instant::now(),
        }
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Caches `get_table_schema` and `get_db_table_list` results.
pub struct MetadataCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        if let Some(entry) = self.entries.get(key) {
            if entry.age() < self.ttl {
                debug!(key = %key, "Metadata cache hit");
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        None
    }

    pub fn get_columns(&self, db: &str, table: &str) -> Option<Vec<ColumnSchema>> {
        match self.lookup(&CacheKey::table_schema(db, table))? {
            CachedValue::Columns(columns) => Some(columns),
            CachedValue::Tables(_) => None,
        }
    }

    pub fn set_columns(&self, db: &str, table: &str, columns: Vec<ColumnSchema>) {
        debug!(db, table, columns = columns.len(), "Caching table schema");
        self.entries.insert(
            CacheKey::table_schema(db, table),
            CacheEntry::new(CachedValue::Columns(columns)),
        );
    }

    pub fn get_tables(&self, db: &str) -> Option<Vec<TableInfo>> {
        match self.lookup(&CacheKey::database_tables(db))? {
            CachedValue::Tables(tables) => Some(tables),
            CachedValue::Columns(_) => None,
        }
    }

    pub fn set_tables(&self, db: &str, tables: Vec<TableInfo>) {
        debug!(db, tables = tables.len(), "Caching table list");
        self.entries.insert(
            CacheKey::database_tables(db),
            CacheEntry::new(CachedValue::Tables(tables)),
        );
    }

    /// Clears one kind of entry, or everything when `kind` is `None`.
    /// Returns the cleared keys.
    pub fn clear(&self, kind: Option<CacheKind>) -> Vec<String> {
        let cleared: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| kind.is_none_or(|kind| entry.key().kind == kind))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &cleared {
            self.entries.remove(key);
        }

        let label = kind.map_or("all", |kind| kind.as_str());
        info!(cleared = cleared.len(), kind = label, "Cleared metadata cache");
        cleared.iter().map(ToString::to_string).collect()
    }

    /// Drops the schema entry of one table. Returns whether one existed.
    pub fn invalidate_table(&self, db: &str, table: &str) -> bool {
        self.entries
            .remove(&CacheKey::table_schema(db, table))
            .is_some()
    }

    /// Drops the table list and every table schema of `db`.
    pub fn invalidate_database(&self, db: &str) -> Invalidation {
        let database_tables = self.entries.remove(&CacheKey::database_tables(db)).is_some();
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !(key.kind == CacheKind::TableSchema && key.db == db));
        let table_schemas = before - self.entries.len();

        info!(db, table_schemas, database_tables, "Invalidated database metadata");
        Invalidation {
            database_tables: usize::from(database_tables),
            table_schemas,
            total: table_schemas + usize::from(database_tables),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            ttl_seconds: self.ttl.as_secs(),
            ..CacheStats::default()
        };

        let mut total_age = 0.0;
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            match entry.key().kind {
                CacheKind::TableSchema => stats.table_schema_entries += 1,
                CacheKind::DatabaseTables => stats.database_tables_entries += 1,
            }
            let age = entry.value().age();
            if age >= self.ttl {
                stats.expired_entries += 1;
            }
            let secs = age.as_secs_f64();
            total_age += secs;
            stats.max_age_seconds = stats.max_age_seconds.max(secs);
        }

        stats.valid_entries = stats.total_entries - stats.expired_entries;
        if stats.total_entries > 0 {
            stats.average_age_seconds = total_age / stats.total_entries as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

/// What [`MetadataCache::invalidate_database`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Invalidation {
    pub database_tables: usize,
    pub table_schemas: usize,
    pub total: usize,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub table_schema_entries: usize,
    pub database_tables_entries: usize,
    pub ttl_seconds: u64,
    pub average_age_seconds: f64,
    pub max_age_seconds: f64,
    pub expired_entries: usize,
    pub valid_entries: usize,
}
