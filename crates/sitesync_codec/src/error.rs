//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Input had bytes left over after a complete message.
    #[error("trailing bytes after message: {count}")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// Unknown tag byte for a tagged union.
    #[error("unknown {what} tag: {tag}")]
    UnknownTag {
        /// What kind of tag was being decoded.
        what: &'static str,
        /// The offending tag byte.
        tag: u8,
    },

    /// A varint did not terminate within 10 bytes.
    #[error("varint overflow")]
    VarintOverflow,

    /// A declared length exceeds the decoder's safety limit.
    #[error("declared length {len} exceeds limit {limit}")]
    LengthOverflow {
        /// The declared length.
        len: u64,
        /// The limit that was exceeded.
        limit: u64,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Invalid wire structure.
    #[error("invalid wire structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// Invalid JSON representation.
    #[error("invalid JSON representation: {message}")]
    InvalidJson {
        /// Description of the JSON error.
        message: String,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create an invalid JSON error.
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::InvalidJson {
            message: message.into(),
        }
    }
}
