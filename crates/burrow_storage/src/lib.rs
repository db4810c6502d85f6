//! # Burrow Storage
//!
//! The storage-engine seam consumed by the BurrowDB core, and the built-in
//! `shale` engine.
//!
//! Engines are capabilities selected by name through a process-wide registry:
//! an engine supplies its file extension, an existence probe, and an open
//! function returning a [`DataFile`]. The core never links a concrete engine;
//! it only consumes the narrow traits in this crate:
//!
//! - [`DataFile`]: one handle on a physical database file. Two handles may
//!   share the same physical file; commits made through one handle are
//!   fanned out to [`CommitListener`]s registered on the others.
//! - [`KeyStore`]: a named, persistent ordered map of byte key to
//!   (meta, body, sequence). Mutation goes through an
//!   [`ExclusiveTransaction`], which stages writes and applies them on
//!   commit.
//! - [`Query`] / [`QueryEnumerator`]: compiled queries and their immutable
//!   result snapshots, with last-sequence tracking for obsolescence checks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod data_file;
#[cfg(feature = "encryption")]
mod encrypted;
mod engine;
mod error;
mod key;
mod query;
mod shale;

pub use data_file::{
    ChangedStore, CommitInfo, CommitListener, DataFile, ExclusiveTransaction, KeyStore,
    MaintenanceKind, OpenOptions, Record, SequenceMode, Timestamp, DEFAULT_KEY_STORE,
};
pub use engine::{engine_named, register_engine, registered_engines, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use key::EncryptionKey;
pub use query::{Query, QueryEnumerator, QueryLanguage, QueryOptions, QueryRow};
pub use shale::{ShaleEngine, SHALE_ENGINE_NAME};
