//! The data-file and key-store seam.

use crate::error::StorageResult;
use crate::key::EncryptionKey;
use crate::query::{Query, QueryLanguage};
use std::path::Path;
use std::sync::Arc;

/// Name of the engine's default key-store (backs the default collection).
pub const DEFAULT_KEY_STORE: &str = "default";

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Whether a key-store assigns sequence numbers to mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    /// Every mutation gets a monotonically increasing sequence number.
    Sequenced,
    /// No sequence tracking (metadata stores).
    NoSequences,
}

/// Maintenance operations on a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    /// Reclaim space.
    Compact,
    /// Compact plus index optimization.
    FullOptimize,
}

/// Options for opening a data file.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Open for writing.
    pub writeable: bool,
    /// Permit in-place format upgrades.
    pub upgradeable: bool,
    /// Encryption key, if the file is or should be encrypted.
    pub encryption_key: Option<EncryptionKey>,
}

/// One stored record: byte key, metadata, body, sequence, expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record key.
    pub key: Vec<u8>,
    /// Opaque metadata.
    pub meta: Vec<u8>,
    /// Record body.
    pub body: Vec<u8>,
    /// Sequence assigned at commit; 0 in sequence-less stores.
    pub sequence: u64,
    /// Optional expiration time.
    pub expiration: Option<Timestamp>,
}

/// A key-store touched by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedStore {
    /// Key-store name.
    pub name: String,
    /// The store's last sequence after the commit.
    pub last_sequence: u64,
}

/// Summary of a committed transaction.
#[derive(Debug, Clone, Default)]
pub struct CommitInfo {
    /// Stores mutated by the transaction, with their post-commit sequences.
    pub changed_stores: Vec<ChangedStore>,
}

/// Observer of commits made through *sibling* handles on the same physical
/// file.
///
/// Listeners may be invoked on an arbitrary thread (the committer's).
pub trait CommitListener: Send + Sync {
    /// Called after a sibling handle durably commits a transaction.
    fn transaction_committed(&self, changes: &[ChangedStore]);
}

/// A persistent ordered map of byte key to (meta, body, sequence).
///
/// Reads go through this trait; all mutation goes through an
/// [`ExclusiveTransaction`].
pub trait KeyStore: Send + Sync {
    /// The store's name.
    fn name(&self) -> &str;

    /// Reads one record.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Record>>;

    /// The last sequence assigned in this store (0 if none).
    fn last_sequence(&self) -> StorageResult<u64>;

    /// Number of live records.
    fn record_count(&self) -> StorageResult<u64>;

    /// The earliest expiration time of any record, if any record expires.
    fn next_expiration(&self) -> StorageResult<Option<Timestamp>>;

    /// Snapshot of all live records in key order.
    fn scan(&self) -> StorageResult<Vec<Record>>;
}

/// An exclusive writer session on a data file.
///
/// Writes are staged and become visible to other handles only on commit.
/// Reads through the transaction see staged writes. Exactly one exclusive
/// transaction exists per physical file at a time; `begin_exclusive` blocks
/// until the current writer finishes.
pub trait ExclusiveTransaction: Send {
    /// Stages a write of `key` in `store`.
    fn set(&mut self, store: &str, key: &[u8], meta: &[u8], body: &[u8]) -> StorageResult<()>;

    /// Stages a deletion. Returns false if the key does not exist.
    fn delete(&mut self, store: &str, key: &[u8]) -> StorageResult<bool>;

    /// Reads a record, observing staged writes first.
    fn get(&self, store: &str, key: &[u8]) -> StorageResult<Option<Record>>;

    /// Stages an expiration change. Returns false if the key does not exist.
    fn set_expiration(
        &mut self,
        store: &str,
        key: &[u8],
        when: Option<Timestamp>,
    ) -> StorageResult<bool>;

    /// Purges records whose expiration is at or before `now`.
    ///
    /// Returns the purged keys.
    fn expire_records(&mut self, store: &str, now: Timestamp) -> StorageResult<Vec<Vec<u8>>>;

    /// Stages deletion of an entire key-store.
    fn delete_key_store(&mut self, store: &str) -> StorageResult<()>;

    /// Applies all staged writes durably.
    ///
    /// On success the transaction is finished and sibling handles have been
    /// notified. Calling `commit` or `abort` again is an error.
    fn commit(&mut self) -> StorageResult<CommitInfo>;

    /// Discards all staged writes and finishes the transaction.
    fn abort(&mut self) -> StorageResult<()>;
}

/// One handle on a physical database file.
///
/// Multiple handles may be open on the same physical file (a foreground and
/// a background handle); the engine reconciles them and fans commits out to
/// the other handles' [`CommitListener`]s.
pub trait DataFile: Send + Sync {
    /// Path of the underlying file.
    fn path(&self) -> &Path;

    /// Whether this handle is still open.
    fn is_open(&self) -> bool;

    /// Opens a key-store, creating it if absent.
    ///
    /// The sequence mode is fixed when the store is first created.
    fn key_store(&self, name: &str, mode: SequenceMode) -> StorageResult<Arc<dyn KeyStore>>;

    /// Whether a key-store exists.
    fn key_store_exists(&self, name: &str) -> StorageResult<bool>;

    /// Names of all key-stores, sorted.
    fn all_key_store_names(&self) -> StorageResult<Vec<String>>;

    /// Begins the exclusive writer session, blocking until available.
    fn begin_exclusive(&self) -> StorageResult<Box<dyn ExclusiveTransaction>>;

    /// Compiles a query against this handle.
    fn compile_query(
        &self,
        expression: &str,
        language: QueryLanguage,
    ) -> StorageResult<Box<dyn Query>>;

    /// Registers a commit listener for commits made through sibling handles.
    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>);

    /// Removes a previously registered listener (matched by identity).
    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>);

    /// Runs a maintenance operation.
    fn maintenance(&self, kind: MaintenanceKind) -> StorageResult<()>;

    /// Re-encrypts the file with `key`, or decrypts it when `None`.
    fn rekey(&self, key: Option<EncryptionKey>) -> StorageResult<()>;

    /// Closes this handle, flushing pending state.
    fn close(&self) -> StorageResult<()>;

    /// Closes this handle and deletes the file on disk.
    fn delete_data_file(&self) -> StorageResult<()>;
}
