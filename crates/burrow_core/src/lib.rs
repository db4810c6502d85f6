//! # Burrow Core
//!
//! An embeddable document database engine with change-feed-driven live
//! queries.
//!
//! Documents are JSON-like records organized into named collections within
//! a database bundle. The engine provides:
//! - Database lifecycle: open, close, rekey, delete
//! - Collection management backed by storage-engine key-stores
//! - Nested transactions with per-collection observers and cross-handle
//!   commit notification
//! - Persistent identity (public/private UUIDs, peer ID) and a
//!   remote-database registry
//! - Content-addressed blobs with mark-and-sweep garbage collection
//! - The [`LiveQuerier`]: a background actor re-running queries with
//!   adaptive debouncing and obsolescence detection

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod background;
mod blob;
mod bundle;
mod collection;
mod config;
mod database;
mod error;
mod housekeeper;
mod identity;
mod info;
mod live_query;
mod remotes;
mod sequence_tracker;

pub use background::{BackgroundDb, TransactionObserver};
pub use blob::{BlobKey, BlobStore};
pub use bundle::Bundle;
pub use collection::{
    collection_name_is_valid, collection_name_to_key_store_name,
    key_store_name_to_collection_name, Collection, DEFAULT_COLLECTION_NAME,
};
pub use config::{DatabaseConfig, Versioning};
pub use database::{Database, LOCAL_CHECKPOINT_STORE, PEER_CHECKPOINT_STORE};
pub use error::{Error, Result};
pub use identity::UuidKind;
pub use info::{DEFAULT_MAX_REV_TREE_DEPTH, INFO_STORE};
pub use live_query::{LiveQuerier, LiveQuerierDelegate};
pub use sequence_tracker::SequenceTracker;

pub use burrow_codec::Value;
pub use burrow_storage::{
    EncryptionKey, MaintenanceKind, QueryEnumerator, QueryLanguage, QueryOptions, Timestamp,
};
