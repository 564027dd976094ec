//! Error types for Acelerar
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Acelerar operations
pub type Result<T> = std::result::Result<T, AcelerarError>;

/// Error type for all Acelerar operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcelerarError {
    /// Invalid shape specification
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Reason for invalidity
        reason: String,
    },

    /// Weight type id not recognized by the kernel family
    #[error("Unsupported weight type id {type_id}")]
    UnsupportedWeightType {
        /// The raw type id that was passed in
        type_id: i32,
    },
}
