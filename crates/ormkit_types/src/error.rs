//! Error types for the types crate.

use thiserror::Error;

/// Result type for primitive operations.
pub type TypesResult<T> = Result<T, TypesError>;

/// Errors raised by keys, tuples, versions and the snapshot codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// A slot index was outside the tuple's arity.
    #[error("slot {index} out of range for tuple of arity {arity}")]
    SlotOutOfRange {
        /// Requested slot.
        index: usize,
        /// Arity of the tuple.
        arity: usize,
    },

    /// Two tuples with different shapes were combined.
    #[error("arity mismatch: expected {expected}, got {actual}")]
    ArityMismatch {
        /// Expected arity.
        expected: usize,
        /// Actual arity.
        actual: usize,
    },

    /// A key was built without any value.
    #[error("key for type {type_id} has no values")]
    EmptyKey {
        /// Raw type id of the key.
        type_id: u32,
    },

    /// Failed to encode to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },
}

impl TypesError {
    /// Creates a slot out of range error.
    pub fn slot_out_of_range(index: usize, arity: usize) -> Self {
        Self::SlotOutOfRange { index, arity }
    }

    /// Creates an arity mismatch error.
    pub fn arity_mismatch(expected: usize, actual: usize) -> Self {
        Self::ArityMismatch { expected, actual }
    }

    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
