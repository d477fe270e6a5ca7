//! Error types for matching and quantity parsing.

use thiserror::Error;

/// Malformed node selector or affinity data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("unsupported node selector operator '{operator}' for key '{key}'")]
    InvalidOperator { key: String, operator: String },

    #[error("operator {operator} on key '{key}' requires {expected}, got {got} value(s)")]
    InvalidValueCount {
        key: String,
        operator: String,
        expected: &'static str,
        got: usize,
    },

    #[error("operator {operator} on key '{key}' requires an integer value, got '{value}'")]
    NonIntegerValue {
        key: String,
        operator: String,
        value: String,
    },

    #[error("unsupported node field selector key '{0}'")]
    UnsupportedField(String),

    /// Every term was malformed; carries the messages joined.
    #[error("invalid node selector terms: {0}")]
    Terms(String),
}

/// A resource quantity that does not follow Kubernetes quantity syntax.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid quantity '{input}': {reason}")]
pub struct QuantityError {
    pub input: String,
    pub reason: &'static str,
}

impl QuantityError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}
