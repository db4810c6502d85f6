//! Error taxonomy for the database engine.

use burrow_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the database engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The database (or a handle it owns) is not open.
    #[error("database is not open")]
    NotOpen,

    /// An operation that requires a transaction was called outside one.
    #[error("no transaction is open")]
    NotInTransaction,

    /// An operation that forbids a transaction was called inside one.
    #[error("a transaction is still open")]
    TransactionNotClosed,

    /// The file is not a database, or not in the expected format.
    #[error("wrong database format: {message}")]
    WrongFormat {
        /// Description of the mismatch.
        message: String,
    },

    /// The database file uses an older format and was not upgraded.
    #[error("database file format is too old")]
    DatabaseTooOld,

    /// An invalid argument was supplied.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the invalid argument.
        message: String,
    },

    /// The requested capability is not available.
    #[error("unimplemented: {message}")]
    Unimplemented {
        /// What was requested.
        message: String,
    },

    /// An encryption key was configured but this build excludes encryption.
    #[error("encryption is not supported by this build")]
    UnsupportedEncryption,

    /// A document body failed structural validation.
    #[error("corrupt revision data: {message}")]
    CorruptRevisionData {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the database bundle's lock.
    #[error("database is locked by another process")]
    DatabaseLocked,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec error while decoding stored data.
    #[error("codec error: {0}")]
    Codec(#[from] burrow_codec::CodecError),

    /// Opaque storage-engine error.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl Error {
    /// Creates a wrong-format error.
    pub fn wrong_format(message: impl Into<String>) -> Self {
        Self::WrongFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid-parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates an unimplemented error.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented {
            message: message.into(),
        }
    }

    /// Creates a corrupt-revision-data error.
    pub fn corrupt_revision_data(message: impl Into<String>) -> Self {
        Self::CorruptRevisionData {
            message: message.into(),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotOpen => Error::NotOpen,
            StorageError::DatabaseTooOld { .. } => Error::DatabaseTooOld,
            StorageError::WrongFormat { message } => Error::WrongFormat { message },
            StorageError::Unimplemented { message } => Error::Unimplemented { message },
            StorageError::EncryptionNotSupported => Error::UnsupportedEncryption,
            StorageError::Codec(e) => Error::Codec(e),
            other => Error::Storage(other),
        }
    }
}
