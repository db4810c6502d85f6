//! Error types for the codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before a complete value was decoded.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof {
        /// Offset at which more bytes were needed.
        offset: usize,
    },

    /// An unknown or unsupported type tag was encountered.
    #[error("unsupported type byte {byte:#04x} at offset {offset}")]
    UnsupportedType {
        /// The offending initial byte.
        byte: u8,
        /// Offset of the byte.
        offset: usize,
    },

    /// A text string was not valid UTF-8.
    #[error("invalid UTF-8 in text string at offset {offset}")]
    InvalidUtf8 {
        /// Offset of the string payload.
        offset: usize,
    },

    /// Trailing bytes remained after the top-level value.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of undecoded bytes.
        remaining: usize,
    },

    /// A length field exceeded the remaining input.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverflow {
        /// Declared payload length.
        declared: u64,
        /// Bytes actually remaining.
        remaining: usize,
    },
}
