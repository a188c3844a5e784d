//! Read-only SQL guard.
//!
//! Rejects statements that write, change schema or administer the cluster,
//! plus the usual injection shapes. `exec_query` consults it when one is
//! configured.

use crate::error::{SecurityError, SecurityResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Pluggable statement check run before a query reaches the backend.
pub trait QueryGuard: Send + Sync {
    /// # Errors
    ///
    /// A [`SecurityError`] describing why the statement is refused.
    fn check(&self, sql: &str) -> SecurityResult<()>;
}

/// Keywords of statements that modify data, schema or the cluster.
static FORBIDDEN_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
        "REPLACE", "MERGE", "RENAME", "LOAD", "EXPORT", "BACKUP", "RESTORE", "KILL", "RECOVER",
        "ADMIN", "INSTALL", "UNINSTALL", "CANCEL",
    ]
    .into_iter()
    .collect()
});

/// Statement prefixes the guard lets through.
const READ_PREFIXES: [&str; 6] = ["SELECT", "WITH", "EXPLAIN", "SHOW", "DESCRIBE", "DESC"];

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i);\s*(DROP|DELETE|UPDATE|INSERT|TRUNCATE|ALTER|CREATE)")
            .expect("Invalid regex: statement injection pattern"),
        Regex::new(r"(?i)--\s*$").expect("Invalid regex: line comment pattern"),
        Regex::new(r"(?i)UNION\s+(ALL\s+)?SELECT\s+.*\bFROM\s+(mysql|information_schema)\.")
            .expect("Invalid regex: UNION metadata pattern"),
        Regex::new(r"(?i)INTO\s+(OUTFILE|DUMPFILE)").expect("Invalid regex: INTO OUTFILE pattern"),
        Regex::new(r"(?i)LOAD_FILE\s*\(").expect("Invalid regex: LOAD_FILE pattern"),
        Regex::new(r"(?i)BENCHMARK\s*\(").expect("Invalid regex: BENCHMARK pattern"),
        Regex::new(r"(?i)SLEEP\s*\(").expect("Invalid regex: SLEEP pattern"),
    ]
});

/// Read-only statement validator.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    max_query_length: usize,
    strict_mode: bool,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self {
            max_query_length: 10000,
            strict_mode: true,
        }
    }
}

impl SqlValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_query_length(mut self, length: usize) -> Self {
        self.max_query_length = length;
        self
    }

    /// Strict mode refuses more than one statement per call.
    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn validate(&self, query: &str) -> SecurityResult<()> {
        debug!("Validating query: {}", query.chars().take(100).collect::<String>());
        self.check_length(query)?;
        self.check_structure(query)?;
        self.check_forbidden_keywords(query)?;
        self.check_injection_patterns(query)?;
        Ok(())
    }

    fn check_length(&self, query: &str) -> SecurityResult<()> {
        if query.len() > self.max_query_length {
            return Err(SecurityError::QueryTooComplex(format!(
                "Query exceeds maximum length of {} characters",
                self.max_query_length
            )));
        }
        Ok(())
    }

    fn check_structure(&self, query: &str) -> SecurityResult<()> {
        let upper = query.trim_start().to_uppercase();
        let leading = upper
            .split(|c: char| !c.is_ascii_alphabetic())
            .next()
            .unwrap_or_default();
        if !READ_PREFIXES.contains(&leading) {
            return Err(SecurityError::QueryNotAllowed(
                "Only SELECT, WITH, EXPLAIN, SHOW, and DESCRIBE queries are allowed".into(),
            ));
        }

        if self.strict_mode {
            let statements = query
                .split(';')
                .filter(|part| !part.trim().is_empty())
                .count();
            if statements > 1 {
                return Err(SecurityError::QueryNotAllowed(
                    "Multiple statements not allowed".into(),
                ));
            }
        }
        Ok(())
    }

    fn check_forbidden_keywords(&self, query: &str) -> SecurityResult<()> {
        let upper = query.to_uppercase();
        let forbidden = upper
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .find(|word| FORBIDDEN_KEYWORDS.contains(word));
        if let Some(word) = forbidden {
            warn!("Forbidden keyword detected: {}", word);
            return Err(SecurityError::ForbiddenKeyword(word.to_string()));
        }
        Ok(())
    }

    fn check_injection_patterns(&self, query: &str) -> SecurityResult<()> {
        if let Some(pattern) = INJECTION_PATTERNS.iter().find(|p| p.is_match(query)) {
            warn!("SQL injection pattern detected: {}", pattern.as_str());
            return Err(SecurityError::SqlInjection(format!(
                "Suspicious pattern detected: {}",
                pattern.as_str()
            )));
        }
        Ok(())
    }
}

impl QueryGuard for SqlValidator {
    fn check(&self, sql: &str) -> SecurityResult<()> {
        self.validate(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statements_pass() {
        let validator = SqlValidator::new();
        assert!(validator.validate("SELECT * FROM orders").is_ok());
        assert!(validator.validate("select id from orders where id = 1;").is_ok());
        assert!(validator.validate("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());
        assert!(validator.validate("SHOW DATABASES").is_ok());
        assert!(validator.validate("DESC orders").is_ok());
        assert!(validator.validate("EXPLAIN SELECT 1").is_ok());
    }

    #[test]
    fn test_writes_are_refused() {
        let validator = SqlValidator::new();
        assert!(matches!(
            validator.validate("UPDATE t SET x=1"),
            Err(SecurityError::QueryNotAllowed(_))
        ));
        assert!(matches!(
            validator.validate("SELECT * FROM t WHERE id IN (DELETE FROM u)"),
            Err(SecurityError::ForbiddenKeyword(word)) if word == "DELETE"
        ));
        // Prefix alone is not enough.
        assert!(validator.validate("DESCRIPTION").is_err());
    }

    #[test]
    fn test_injection_patterns() {
        let validator = SqlValidator::new().strict_mode(false);
        assert!(matches!(
            validator.validate("SELECT * FROM t; DROP TABLE t"),
            Err(SecurityError::ForbiddenKeyword(_))
        ));
        assert!(matches!(
            validator.validate("SELECT SLEEP(10)"),
            Err(SecurityError::SqlInjection(_))
        ));
        assert!(matches!(
            validator.validate("SELECT * FROM t INTO OUTFILE '/tmp/x'"),
            Err(SecurityError::SqlInjection(_))
        ));
    }

    #[test]
    fn test_multiple_statements_in_strict_mode() {
        let validator = SqlValidator::new();
        assert!(validator.validate("SELECT 1; SELECT 2").is_err());
        assert!(SqlValidator::new().strict_mode(false).validate("SELECT 1; SELECT 2").is_ok());
    }

    #[test]
    fn test_query_length() {
        let validator = SqlValidator::new().max_query_length(20);
        assert!(matches!(
            validator.check("SELECT * FROM a_rather_long_table_name"),
            Err(SecurityError::QueryTooComplex(_))
        ));
    }
}
