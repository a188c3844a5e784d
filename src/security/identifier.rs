//! Identifier validation for names interpolated into metadata queries.

use crate::error::{SecurityError, SecurityResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Longest identifier Doris accepts.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Letters, digits, `_` and `-`; must not start with a digit or `-`.
static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("Invalid regex: identifier pattern")
});

/// Checks `name` before it is spliced into SQL.
///
/// `kind` names the identifier in the error ("table name", "database name",
/// "catalog name").
///
/// # Errors
///
/// [`SecurityError::InvalidIdentifier`] when `name` is empty, too long or
/// contains anything outside the identifier alphabet.
pub fn validate_identifier(name: &str, kind: &'static str) -> SecurityResult<()> {
    let reason = if name.is_empty() {
        "must not be empty".to_string()
    } else if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        format!("exceeds {} characters", MAX_IDENTIFIER_LENGTH)
    } else if !IDENTIFIER_REGEX.is_match(name) {
        format!("'{}' contains invalid characters", name)
    } else {
        return Ok(());
    };

    warn!(kind, "Rejected identifier: {}", reason);
    Err(SecurityError::InvalidIdentifier {
        kind: kind.into(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_identifier("users", "table name").is_ok());
        assert!(validate_identifier("_tmp_2024", "table name").is_ok());
        assert!(validate_identifier("ods-sales", "database name").is_ok());
    }

    #[test]
    fn test_injection_is_rejected() {
        let err = validate_identifier("users; DROP TABLE x", "table name").unwrap_err();
        assert!(err.to_string().starts_with("Invalid table name:"));
        assert!(validate_identifier("a`b", "table name").is_err());
        assert!(validate_identifier("a.b", "table name").is_err());
        assert!(validate_identifier("x' OR '1'='1", "database name").is_err());
    }

    #[test]
    fn test_shape_limits() {
        assert!(validate_identifier("", "catalog name").is_err());
        assert!(validate_identifier("1table", "table name").is_err());
        assert!(validate_identifier("-table", "table name").is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH), "table name").is_ok());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1), "table name").is_err());
    }
}
