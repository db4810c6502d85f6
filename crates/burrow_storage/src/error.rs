//! Error types for storage engines.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by storage engines.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec error while reading or writing the file format.
    #[error("codec error: {0}")]
    Codec(#[from] burrow_codec::CodecError),

    /// The data file uses an older on-disk format version.
    ///
    /// Callers that permit upgrades should run the engine's upgrade hook and
    /// retry the open once.
    #[error("data file format is too old (found v{found}, need v{need})")]
    DatabaseTooOld {
        /// Version found in the file header.
        found: u16,
        /// Version this build writes.
        need: u16,
    },

    /// The file is not a database in this engine's format.
    #[error("wrong data file format: {message}")]
    WrongFormat {
        /// Description of the mismatch.
        message: String,
    },

    /// The data file handle has been closed.
    #[error("data file is not open")]
    NotOpen,

    /// An encryption key was supplied but this build cannot use it.
    #[error("encryption is not supported by this build")]
    EncryptionNotSupported,

    /// Encryption or decryption of the data file failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// The requested capability is not implemented by this engine.
    #[error("unimplemented: {message}")]
    Unimplemented {
        /// What was requested.
        message: String,
    },

    /// The data file contents are corrupt.
    #[error("corrupt data file: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// An operation was attempted in an invalid state.
    #[error("invalid storage operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StorageError {
    /// Creates a wrong-format error.
    pub fn wrong_format(message: impl Into<String>) -> Self {
        Self::WrongFormat {
            message: message.into(),
        }
    }

    /// Creates an unimplemented error.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented {
            message: message.into(),
        }
    }

    /// Creates a corrupt-file error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
