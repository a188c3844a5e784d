//! Identifier and SQL validation.

pub mod identifier;
pub mod validator;

pub use identifier::{MAX_IDENTIFIER_LENGTH, validate_identifier};
pub use validator::{QueryGuard, SqlValidator};
