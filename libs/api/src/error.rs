//! Error types for object keys and label selectors.

use thiserror::Error;

/// Errors that can occur when splitting an object key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("object key cannot be empty")]
    Empty,

    /// The key has more than one `/` separator.
    #[error("unexpected key format: {0:?}")]
    InvalidFormat(String),
}

/// Errors that can occur when converting a label selector.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// A label key is not a valid qualified name.
    #[error("invalid label key {key:?}: {message}")]
    InvalidKey { key: String, message: String },

    /// A label value is not valid.
    #[error("invalid label value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },

    /// `In` / `NotIn` requirement without values.
    #[error("values must be non-empty for operator {operator} on key {key:?}")]
    MissingValues { key: String, operator: String },

    /// `Exists` / `DoesNotExist` requirement with values.
    #[error("values must be empty for operator {operator} on key {key:?}")]
    UnexpectedValues { key: String, operator: String },

    /// The selector is absent where one is required.
    #[error("selector is missing")]
    Missing,
}

impl SelectorError {
    /// Returns true if this error concerns a label key.
    pub fn is_key_error(&self) -> bool {
        matches!(self, SelectorError::InvalidKey { .. })
    }
}
