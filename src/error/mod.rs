//! Error types for the gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.

use std::borrow::Cow;
use thiserror::Error;

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-RPC 2.0 and MCP protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid JSON")]
    ParseError,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
        }
    }
}

/// Database, pool and connection errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool is unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection acquisition timed out after {0}ms")]
    AcquisitionTimeout(u64),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Query timeout after {0}ms")]
    QueryTimeout(u64),
}

/// Security-related errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Invalid {kind}: {reason}")]
    InvalidIdentifier {
        kind: Cow<'static, str>,
        reason: String,
    },

    #[error("SQL injection detected: {0}")]
    SqlInjection(String),

    #[error("Forbidden keyword: {0}")]
    ForbiddenKeyword(String),

    #[error("Query not allowed: {0}")]
    QueryNotAllowed(String),

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

/// Result type alias for McpError.
pub type Result<T> = std::result::Result<T, McpError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for SecurityError.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::ParseError.code(), -32700);
        assert_eq!(ProtocolError::MethodNotFound("test".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("test".into()).code(), -32602);
        assert_eq!(ProtocolError::InternalError("test".into()).code(), -32603);
    }

    #[test]
    fn test_error_conversion() {
        let db_error = DatabaseError::PoolUnavailable("recovery failed".into());
        let mcp_error: McpError = db_error.into();
        assert!(matches!(mcp_error, McpError::Database(_)));
    }

    #[test]
    fn test_timeouts_report_milliseconds() {
        assert_eq!(
            DatabaseError::AcquisitionTimeout(10_000).to_string(),
            "Connection acquisition timed out after 10000ms"
        );
        assert_eq!(
            DatabaseError::QueryTimeout(5_000).to_string(),
            "Query timeout after 5000ms"
        );
    }

    #[test]
    fn test_invalid_identifier_message() {
        let err = SecurityError::InvalidIdentifier {
            kind: "table name".into(),
            reason: "contains ';'".into(),
        };
        assert_eq!(err.to_string(), "Invalid table name: contains ';'");
    }
}
