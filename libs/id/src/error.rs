//! Error type for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing a typed ID from its string form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID does not carry the prefix of the requested type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separating prefix from payload.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID payload did not parse.
    #[error("invalid ULID payload: {0}")]
    InvalidUlid(String),
}
