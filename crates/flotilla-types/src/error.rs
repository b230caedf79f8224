//! Validation error shared by the model constructors.

use thiserror::Error;

/// A model object or configuration failed validation. Nothing is mutated
/// when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct InvalidInput {
    pub field: &'static str,
    pub message: String,
}

impl InvalidInput {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}
