//! Error types for the deblender.
//!
//! Only precondition violations and unimplemented features are reported as
//! errors. Numerical degeneracies (zero-sum colour columns, singular normal
//! matrices) are resolved in place by deterministic substitution rules and
//! never surface here.

use thiserror::Error;

/// Errors returned by the deblender.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeblendError {
    /// A caller-supplied argument violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Two matrices (or a matrix and a grid) do not have compatible shapes.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },

    /// A reshaped template was requested but no footprint grid shape was supplied.
    #[error("a footprint grid shape is required to reshape a template")]
    MissingShape,

    /// The requested feature exists in the model but is not implemented.
    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

impl DeblendError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Display,
        found: impl std::fmt::Display,
    ) -> Self {
        DeblendError::ShapeMismatch {
            context,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeblendError>;
