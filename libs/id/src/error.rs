//! Error types for identifier parsing.

use thiserror::Error;

/// Errors that can occur when parsing an identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The input is not a UUID.
    #[error("invalid {kind} id '{input}': {reason}")]
    InvalidUuid {
        kind: &'static str,
        input: String,
        reason: String,
    },

    /// The nil UUID is reserved and never names a record.
    #[error("{kind} id cannot be the nil uuid")]
    Nil { kind: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
