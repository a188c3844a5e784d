//! Configuration types and builders.

use crate::error::{ConfigError, McpError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Doris FE query port.
pub const DEFAULT_PORT: u16 = 9030;

/// Backend connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub charset: String,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Connections older than this are recycled instead of reused.
    pub max_connection_age: Duration,
    pub connection_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            user: "root".into(),
            password: String::new(),
            database: "information_schema".into(),
            charset: "utf8".into(),
            min_connections: 0,
            max_connections: 20,
            max_connection_age: Duration::from_secs(3600),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

impl DatabaseConfig {
    pub fn builder() -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::new()
    }

    /// Host and user must be present (not empty, not the literal `null`).
    pub fn validate(&self) -> Result<()> {
        if is_blank(&self.host) {
            return Err(ConfigError::MissingField("host".into()).into());
        }
        if is_blank(&self.user) {
            return Err(ConfigError::MissingField("user".into()).into());
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections".into(),
                message: "Pool size must be greater than 0".into(),
            }
            .into());
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                field: "min_connections".into(),
                message: "Minimum pool size exceeds maximum pool size".into(),
            }
            .into());
        }
        Ok(())
    }

    /// `host:port` for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn is_blank(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null")
}

/// Doris reports `UTF8`/`UTF8MB4`; the wire protocol wants lowercase names.
fn normalize_charset(charset: &str) -> String {
    match charset.to_ascii_uppercase().as_str() {
        "UTF8" => "utf8".into(),
        "UTF8MB4" => "utf8mb4".into(),
        _ => charset.to_ascii_lowercase(),
    }
}

/// Builder for DatabaseConfig with fluent API.
#[derive(Default)]
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    pub fn charset(mut self, charset: impl AsRef<str>) -> Self {
        self.config.charset = normalize_charset(charset.as_ref());
        self
    }

    pub fn min_connections(mut self, size: u32) -> Self {
        self.config.min_connections = size;
        self
    }

    pub fn max_connections(mut self, size: u32) -> Self {
        self.config.max_connections = size;
        self
    }

    pub fn max_connection_age(mut self, age: Duration) -> Self {
        self.config.max_connection_age = age;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Build from environment variables.
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(host) = env::var("DORIS_HOST") {
            self.config.host = host;
        }
        if let Some(port) = env_parse("DORIS_PORT")? {
            self.config.port = port;
        }
        if let Ok(user) = env::var("DORIS_USER") {
            self.config.user = user;
        }
        if let Ok(password) = env::var("DORIS_PASSWORD") {
            self.config.password = password;
        }
        if let Ok(database) = env::var("DORIS_DATABASE") {
            self.config.database = database;
        }
        if let Ok(charset) = env::var("DORIS_CHARSET") {
            self.config.charset = normalize_charset(&charset);
        }
        if let Some(size) = env_parse("DORIS_MIN_CONNECTIONS")? {
            self.config.min_connections = size;
        }
        if let Some(size) = env_parse("DORIS_MAX_CONNECTIONS")? {
            self.config.max_connections = size;
        }
        if let Some(secs) = env_parse("DORIS_MAX_CONNECTION_AGE")? {
            self.config.max_connection_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("DORIS_CONNECTION_TIMEOUT")? {
            self.config.connection_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<DatabaseConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Returns the configuration without validating it.
    ///
    /// Best-effort startup needs the unvalidated value so it can report the
    /// problem instead of refusing to construct the manager.
    pub fn build_unchecked(self) -> DatabaseConfig {
        self.config
    }
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            McpError::Config(ConfigError::InvalidValue {
                field: name.into(),
                message: format!("cannot parse '{}'", raw).into(),
            })
        }),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &'static str, target: &mut Duration) -> Result<()> {
    if let Some(secs) = env_parse::<u64>(name)? {
        *target = Duration::from_secs(secs);
    }
    Ok(())
}

/// Timeouts, sizes and intervals for the pool lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTuning {
    /// Concurrent acquisition attempts allowed, independent of pool size.
    pub admission_permits: usize,
    pub warmup_size: usize,
    pub warmup_acquire_timeout: Duration,
    pub acquire_timeout: Duration,
    pub acquire_retry_timeout: Duration,
    pub recovery_wait: Duration,
    pub health_check_interval: Duration,
    pub probe_acquire_timeout: Duration,
    pub probe_query_timeout: Duration,
    pub ping_timeout: Duration,
    pub recovery_attempts: u32,
    pub recovery_backoff: Duration,
    pub recovery_close_timeout: Duration,
    pub recovery_create_timeout: Duration,
    pub recovery_validate_timeout: Duration,
    pub recovery_warmup_timeout: Duration,
    pub registry_cleanup_interval: Duration,
    pub registry_stale_after: Duration,
    pub connectivity_timeout: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            admission_permits: 20,
            warmup_size: 3,
            warmup_acquire_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(10),
            acquire_retry_timeout: Duration::from_secs(5),
            recovery_wait: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            probe_acquire_timeout: Duration::from_secs(8),
            probe_query_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
            recovery_attempts: 3,
            recovery_backoff: Duration::from_secs(2),
            recovery_close_timeout: Duration::from_secs(3),
            recovery_create_timeout: Duration::from_secs(10),
            recovery_validate_timeout: Duration::from_secs(5),
            recovery_warmup_timeout: Duration::from_secs(5),
            registry_cleanup_interval: Duration::from_secs(300),
            registry_stale_after: Duration::from_secs(3600),
            connectivity_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolTuning {
    /// Applies `DORIS_POOL_*` overrides on top of the current values.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(permits) = env_parse("DORIS_POOL_ADMISSION_PERMITS")? {
            self.admission_permits = permits;
        }
        if let Some(size) = env_parse("DORIS_POOL_WARMUP_SIZE")? {
            self.warmup_size = size;
        }
        if let Some(attempts) = env_parse("DORIS_POOL_RECOVERY_ATTEMPTS")? {
            self.recovery_attempts = attempts;
        }
        env_secs("DORIS_POOL_ACQUIRE_TIMEOUT", &mut self.acquire_timeout)?;
        env_secs(
            "DORIS_POOL_HEALTH_CHECK_INTERVAL",
            &mut self.health_check_interval,
        )?;
        env_secs(
            "DORIS_POOL_CLEANUP_INTERVAL",
            &mut self.registry_cleanup_interval,
        )?;
        env_secs("DORIS_POOL_STALE_AFTER", &mut self.registry_stale_after)?;
        env_secs(
            "DORIS_POOL_CONNECTIVITY_TIMEOUT",
            &mut self.connectivity_timeout,
        )?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.admission_permits == 0 {
            return Err(ConfigError::InvalidValue {
                field: "admission_permits".into(),
                message: "At least one concurrent acquisition must be allowed".into(),
            }
            .into());
        }
        if self.recovery_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recovery_attempts".into(),
                message: "Recovery needs at least one attempt".into(),
            }
            .into());
        }
        Ok(())
    }
}

/// Which session classes keep their connection between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCacheConfig {
    pub cache_system_sessions: bool,
    pub cache_user_sessions: bool,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            cache_system_sessions: true,
            cache_user_sessions: false,
        }
    }
}

/// Security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub max_query_length: usize,
    /// Attach the read-only SQL guard to `exec_query`.
    pub read_only: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_query_length: 10000,
            read_only: true,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub database: DatabaseConfig,
    pub tuning: PoolTuning,
    pub sessions: SessionCacheConfig,
    pub security: SecurityConfig,
    pub metadata_cache_ttl: Duration,
    pub stats_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "doris-mcp-gateway".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            database: DatabaseConfig::default(),
            tuning: PoolTuning::default(),
            sessions: SessionCacheConfig::default(),
            security: SecurityConfig::default(),
            metadata_cache_ttl: Duration::from_secs(3600),
            stats_path: PathBuf::from("logs/mcp_call_stats.json"),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.config.database = database;
        self
    }

    pub fn tuning(mut self, tuning: PoolTuning) -> Self {
        self.config.tuning = tuning;
        self
    }

    pub fn sessions(mut self, sessions: SessionCacheConfig) -> Self {
        self.config.sessions = sessions;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    pub fn metadata_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.metadata_cache_ttl = ttl;
        self
    }

    pub fn stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.stats_path = path.into();
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_builder() {
        let config = DatabaseConfigBuilder::new()
            .host("doris-fe")
            .user("analyst")
            .password("secret")
            .database("sales")
            .max_connections(5)
            .build()
            .unwrap();

        assert_eq!(config.host, "doris-fe");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database, "sales");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.endpoint(), "doris-fe:9030");
    }

    #[test]
    fn test_missing_host_or_user() {
        let err = DatabaseConfigBuilder::new().host("").build().unwrap_err();
        assert!(err.to_string().contains("host"));

        let err = DatabaseConfigBuilder::new().user("null").build().unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_pool_bounds_validation() {
        assert!(
            DatabaseConfigBuilder::new()
                .max_connections(0)
                .build()
                .is_err()
        );
        assert!(
            DatabaseConfigBuilder::new()
                .min_connections(4)
                .max_connections(2)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_charset_normalization() {
        let config = DatabaseConfigBuilder::new().charset("UTF8MB4").build().unwrap();
        assert_eq!(config.charset, "utf8mb4");

        let config = DatabaseConfigBuilder::new().charset("GBK").build().unwrap();
        assert_eq!(config.charset, "gbk");
    }

    #[test]
    fn test_password_not_serialized() {
        let config = DatabaseConfigBuilder::new().password("hunter2").build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = PoolTuning::default();
        assert_eq!(tuning.admission_permits, 20);
        assert_eq!(tuning.warmup_size, 3);
        assert_eq!(tuning.health_check_interval, Duration::from_secs(30));
        assert_eq!(tuning.registry_cleanup_interval, Duration::from_secs(300));
        assert_eq!(tuning.registry_stale_after, Duration::from_secs(3600));
        assert!(tuning.validate().is_ok());

        let broken = PoolTuning {
            recovery_attempts: 0,
            ..PoolTuning::default()
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_session_cache_defaults() {
        let sessions = SessionCacheConfig::default();
        assert!(sessions.cache_system_sessions);
        assert!(!sessions.cache_user_sessions);
    }
}
