//! Error types shared across Genflow crates

use thiserror::Error;

/// Result type alias for value canonicalization
pub type Result<T> = std::result::Result<T, CoercionError>;

/// A value could not be canonicalized to its declared semantic type.
///
/// Raised while computing surrogate keys or binding load values; the row batch
/// carrying the value is aborted before anything reaches the database.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot coerce {value} to {target}: {reason}")]
pub struct CoercionError {
    /// Debug rendering of the offending value
    pub value: String,
    /// Declared target type
    pub target: String,
    /// Why the conversion was refused
    pub reason: String,
}

impl CoercionError {
    pub fn new(value: impl std::fmt::Debug, target: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            value: format!("{:?}", value),
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}
