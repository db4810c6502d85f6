//! Database facade: lifecycle, transactions, collection registry.

use crate::background::BackgroundDb;
use crate::blob::{BlobKey, BlobStore};
use crate::bundle::Bundle;
use crate::collection::{
    collection_name_to_key_store_name, key_store_name_to_collection_name, Collection,
    DEFAULT_COLLECTION_NAME,
};
use crate::config::{DatabaseConfig, Versioning};
use crate::error::{Error, Result};
use crate::info::{INFO_STORE, KEY_VERSIONING};
use burrow_storage::{
    ChangedStore, CommitListener, DataFile, EncryptionKey, ExclusiveTransaction, KeyStore,
    MaintenanceKind, OpenOptions, Record, SequenceMode, StorageEngine, StorageError, Timestamp,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info};

/// Reserved key-store for local replication checkpoints.
pub const LOCAL_CHECKPOINT_STORE: &str = "checkpoints";
/// Reserved key-store for peers' replication checkpoints.
pub const PEER_CHECKPOINT_STORE: &str = "peerCheckpoints";

/// The main database handle.
///
/// A database is a bundle directory holding one data file and a blob store.
/// `open` returns an `Arc`; collections, live queriers, and background
/// workers hold weak references back to it.
pub struct Database {
    config: DatabaseConfig,
    bundle: Bundle,
    engine: Arc<dyn StorageEngine>,
    data_file: Box<dyn DataFile>,
    versioning: Mutex<Versioning>,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    txn_level: AtomicU32,
    txn_handle: Mutex<Option<Box<dyn ExclusiveTransaction>>>,
    background: Mutex<Option<Arc<BackgroundDb>>>,
    blob_store: Mutex<Option<Arc<BlobStore>>>,
    current_key: Mutex<Option<EncryptionKey>>,
    peer_id: AtomicU64,
    max_rev_tree_depth: AtomicU32,
    open: AtomicBool,
    relay: OnceLock<Arc<ExternalCommitRelay>>,
    self_ref: OnceLock<Weak<Database>>,
}

/// Forwards sibling-handle commits into the collection registry.
struct ExternalCommitRelay {
    db: Weak<Database>,
}

impl CommitListener for ExternalCommitRelay {
    fn transaction_committed(&self, changes: &[ChangedStore]) {
        // CAREFUL: this arrives on the committing handle's thread.
        if let Some(db) = self.db.upgrade() {
            for change in changes {
                db.external_transaction_committed(change);
            }
        }
    }
}

impl Database {
    // -----------------------------------------------------------------
    // Lifecycle

    /// Opens (or creates) a database bundle at `path`.
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Arc<Self>> {
        if config.encryption_key.is_some() && cfg!(not(feature = "encryption")) {
            return Err(Error::UnsupportedEncryption);
        }

        let (bundle, engine) =
            Bundle::find_or_create(path, config.create_if_missing, &config.storage_engine)?;

        let options = OpenOptions {
            create: config.create_if_missing,
            writeable: !config.read_only,
            upgradeable: !config.no_upgrade,
            encryption_key: config.encryption_key.clone(),
        };
        let data_file = match engine.open_file(bundle.data_file_path(), &options) {
            Err(StorageError::DatabaseTooOld { .. }) if options.upgradeable => {
                info!(path = %path.display(), "data file format is old; upgrading in place");
                engine.upgrade_file(bundle.data_file_path(), &options)?;
                engine.open_file(bundle.data_file_path(), &options)?
            }
            other => other?,
        };
        // The info store must exist with the right mode before any write
        // reaches it through a transaction.
        data_file.key_store(INFO_STORE, SequenceMode::NoSequences)?;

        let current_key = config.encryption_key.clone();
        let configured_versioning = config.versioning;
        let db = Arc::new(Self {
            config,
            bundle,
            engine,
            data_file,
            versioning: Mutex::new(configured_versioning),
            collections: Mutex::new(HashMap::new()),
            txn_level: AtomicU32::new(0),
            txn_handle: Mutex::new(None),
            background: Mutex::new(None),
            blob_store: Mutex::new(None),
            current_key: Mutex::new(current_key),
            peer_id: AtomicU64::new(0),
            max_rev_tree_depth: AtomicU32::new(0),
            open: AtomicBool::new(true),
            relay: OnceLock::new(),
            self_ref: OnceLock::new(),
        });
        let _ = db.self_ref.set(Arc::downgrade(&db));

        let relay = Arc::new(ExternalCommitRelay {
            db: Arc::downgrade(&db),
        });
        db.data_file.add_commit_listener(relay.clone());
        let _ = db.relay.set(relay);

        db.check_versioning()?;
        db.get_or_create_collection(DEFAULT_COLLECTION_NAME, true)?;
        db.start_background_tasks()?;

        info!(path = %path.display(), engine = db.engine.display_name(), "opened database");
        Ok(db)
    }

    /// Validates (or initializes) the stored versioning scheme.
    fn check_versioning(&self) -> Result<()> {
        let configured = self.config.versioning;
        if let Some(stored) = self.stored_versioning()? {
            if stored >= configured {
                *self.versioning.lock() = stored;
                return Ok(());
            }
        }

        // Absent or lower than configured; recheck inside a transaction in
        // case another handle got here first.
        self.begin_transaction()?;
        let result = (|| -> Result<()> {
            if let Some(stored) = self.stored_versioning()? {
                if stored >= configured {
                    *self.versioning.lock() = stored;
                    return Ok(());
                }
                self.upgrade_document_versioning(stored, configured)?;
            } else if self.config.create_if_missing {
                // First-time initialization.
                self.generate_uuid(crate::identity::UuidKind::Public, false)?;
                self.generate_uuid(crate::identity::UuidKind::Private, false)?;
            } else {
                // An existing database must have its versioning marked.
                return Err(Error::wrong_format("database has no versioning record"));
            }
            self.set_info_u64(KEY_VERSIONING, configured.as_u64())?;
            *self.versioning.lock() = configured;
            Ok(())
        })();
        match result {
            Ok(()) => self.end_transaction(true),
            Err(e) => {
                let _ = self.end_transaction(false);
                Err(e)
            }
        }
    }

    fn stored_versioning(&self) -> Result<Option<Versioning>> {
        Ok(self
            .get_info_u64(KEY_VERSIONING)?
            .and_then(Versioning::from_u64))
    }

    /// Migrates documents from `old` to `new` versioning.
    ///
    /// Document-model migration lives with the document layer; at this
    /// level the scheme change is recorded and logged.
    fn upgrade_document_versioning(&self, old: Versioning, new: Versioning) -> Result<()> {
        info!(?old, ?new, "upgrading document versioning");
        Ok(())
    }

    /// The effective versioning scheme.
    #[must_use]
    pub fn versioning(&self) -> Versioning {
        *self.versioning.lock()
    }

    /// The configuration this database was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The bundle directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.bundle.path()
    }

    /// Whether this handle is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    /// Closes the database.
    ///
    /// Refuses while a transaction is open. Stops background tasks, then
    /// closes the data file.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.must_not_be_in_transaction()?;
        self.stop_background_tasks();
        let collections = self.open_collections();
        for coll in collections {
            coll.close();
        }
        self.collections.lock().clear();
        self.open.store(false, Ordering::Release);
        self.data_file.close()?;
        info!(path = %self.bundle.path().display(), "closed database");
        Ok(())
    }

    /// Closes the database and deletes the whole bundle directory.
    pub fn close_and_delete(&self) -> Result<()> {
        self.must_not_be_in_transaction()?;
        self.stop_background_tasks();
        for coll in self.open_collections() {
            coll.close();
        }
        self.collections.lock().clear();
        self.open.store(false, Ordering::Release);
        self.data_file.delete_data_file()?;
        self.bundle.delete_recursive()?;
        info!(path = %self.bundle.path().display(), "deleted database");
        Ok(())
    }

    fn weak_self(&self) -> Weak<Database> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    /// Re-encrypts the database (data file and blob store) with `new_key`,
    /// or decrypts it when `None`.
    pub fn rekey(&self, new_key: Option<EncryptionKey>) -> Result<()> {
        self.ensure_open()?;
        self.must_not_be_in_transaction()?;
        if new_key.is_some() && cfg!(not(feature = "encryption")) {
            return Err(Error::UnsupportedEncryption);
        }
        info!("rekeying database...");
        self.stop_background_tasks();

        // Build a rekeyed copy of the blob store in a temp directory.
        let temp_path = self.bundle.attachments_temp_path();
        if temp_path.exists() {
            fs::remove_dir_all(&temp_path)?;
        }
        let new_store = BlobStore::open(&temp_path, new_key.is_some(), true)?;
        let result = (|| -> Result<()> {
            self.blob_store()?.copy_blobs_to(&new_store)?;
            self.data_file.rekey(new_key.clone())?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = new_store.delete_store();
            return Err(e);
        }

        // Swap the blob stores.
        let attachments = self.bundle.attachments_path();
        if attachments.exists() {
            fs::remove_dir_all(&attachments)?;
        }
        fs::rename(&temp_path, &attachments)?;
        *self.blob_store.lock() = None;
        *self.current_key.lock() = new_key;

        self.start_background_tasks()?;
        info!("finished rekeying database");
        Ok(())
    }

    /// Runs a maintenance operation. Compaction also garbage-collects
    /// blobs.
    pub fn maintenance(&self, kind: MaintenanceKind) -> Result<()> {
        self.ensure_open()?;
        self.must_not_be_in_transaction()?;
        self.data_file.maintenance(kind)?;
        if kind == MaintenanceKind::Compact {
            self.garbage_collect_blobs()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Background tasks

    /// The lazily created background data-file wrapper.
    pub fn background_db(&self) -> Result<Arc<BackgroundDb>> {
        self.ensure_open()?;
        let mut background = self.background.lock();
        if let Some(bg) = background.as_ref() {
            return Ok(Arc::clone(bg));
        }
        let options = OpenOptions {
            create: false,
            writeable: false,
            upgradeable: false,
            encryption_key: self.current_key.lock().clone(),
        };
        let handle = self
            .engine
            .open_file(self.bundle.data_file_path(), &options)?;
        let bg = BackgroundDb::new(handle);
        *background = Some(Arc::clone(&bg));
        Ok(bg)
    }

    fn stop_background_tasks(&self) {
        // Never hold the collection-registry lock while stopping a
        // housekeeper: its worker may be blocked inside a database call.
        let collections = self.open_collections();
        for coll in collections {
            coll.stop_housekeeping();
        }
        if let Some(bg) = self.background.lock().take() {
            bg.close();
        }
    }

    fn start_background_tasks(&self) -> Result<()> {
        for store_name in self.data_file.all_key_store_names()? {
            let Some(coll_name) = key_store_name_to_collection_name(&store_name) else {
                continue;
            };
            let store = self.data_file.key_store(&store_name, SequenceMode::Sequenced)?;
            if store.next_expiration()?.is_some() {
                if let Some(coll) = self.get_or_create_collection(&coll_name, false)? {
                    coll.start_housekeeping();
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Collections

    /// Returns the default collection.
    pub fn default_collection(&self) -> Result<Arc<Collection>> {
        self.create_collection(DEFAULT_COLLECTION_NAME)
    }

    /// Looks up a collection without creating it.
    ///
    /// Returns `None` when the collection does not exist, including for
    /// names that cannot map to a key-store at all, which short-circuit the
    /// lookup.
    pub fn collection(&self, name: &str) -> Result<Option<Arc<Collection>>> {
        self.get_or_create_collection(name, false)
    }

    /// Opens a collection, creating its key-store if needed.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.get_or_create_collection(name, true)?
            .ok_or_else(|| Error::invalid_parameter(format!("invalid collection name '{name}'")))
    }

    fn get_or_create_collection(
        &self,
        name: &str,
        can_create: bool,
    ) -> Result<Option<Arc<Collection>>> {
        self.ensure_open()?;

        let mut collections = self.collections.lock();
        if let Some(existing) = collections.get(name) {
            return Ok(Some(Arc::clone(existing)));
        }

        let Some(store_name) = collection_name_to_key_store_name(name) else {
            if can_create {
                return Err(Error::invalid_parameter(format!(
                    "invalid collection name '{name}'"
                )));
            }
            // Lookup path: an unmappable name simply does not exist.
            return Ok(None);
        };

        if !can_create && !self.data_file.key_store_exists(&store_name)? {
            return Ok(None);
        }

        let key_store = self
            .data_file
            .key_store(&store_name, SequenceMode::Sequenced)?;
        let collection = Collection::new(self.weak_self(), name, &store_name, key_store)?;
        collections.insert(name.to_string(), Arc::clone(&collection));
        drop(collections);

        // A collection opened mid-transaction joins the in-flight
        // transaction.
        if self.is_in_transaction() {
            collection.transaction_began();
        }
        Ok(Some(collection))
    }

    /// Whether a collection exists (open or on disk).
    pub fn has_collection(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        let Some(store_name) = collection_name_to_key_store_name(name) else {
            return Ok(false);
        };
        if self.collections.lock().contains_key(name) {
            return Ok(true);
        }
        Ok(self.data_file.key_store_exists(&store_name)?)
    }

    /// Deletes a collection and its documents.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if name == DEFAULT_COLLECTION_NAME {
            return Err(Error::invalid_parameter(
                "the default collection cannot be deleted",
            ));
        }
        let store_name = collection_name_to_key_store_name(name)
            .ok_or_else(|| Error::invalid_parameter(format!("invalid collection name '{name}'")))?;

        self.begin_transaction()?;
        let result = (|| {
            let removed = self.collections.lock().remove(name);
            if let Some(coll) = removed {
                coll.close();
            }
            self.with_txn(|txn| {
                txn.delete_key_store(&store_name)?;
                Ok(())
            })
        })();
        match result {
            Ok(()) => self.end_transaction(true),
            Err(e) => {
                let _ = self.end_transaction(false);
                Err(e)
            }
        }
    }

    /// Names of all collections on disk, in unspecified order.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .data_file
            .all_key_store_names()?
            .iter()
            .filter_map(|name| key_store_name_to_collection_name(name))
            .collect())
    }

    fn open_collections(&self) -> Vec<Arc<Collection>> {
        self.collections.lock().values().cloned().collect()
    }

    fn external_transaction_committed(&self, change: &ChangedStore) {
        // Serialized on the collection-registry lock; fan out only to
        // collections whose backing store matches the source.
        let collections = self.collections.lock();
        for coll in collections.values() {
            if coll.key_store_name() == change.name {
                coll.external_transaction_committed(change.last_sequence);
            }
        }
    }

    // -----------------------------------------------------------------
    // Transactions

    /// Begins a (nestable) transaction.
    pub fn begin_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        let mut handle = self.txn_handle.lock();
        let level = self.txn_level.load(Ordering::Acquire);
        if level == 0 {
            *handle = Some(self.data_file.begin_exclusive()?);
        }
        self.txn_level.store(level + 1, Ordering::Release);
        drop(handle);

        if level == 0 {
            for coll in self.open_collections() {
                coll.transaction_began();
            }
        }
        Ok(())
    }

    /// Ends the innermost transaction.
    ///
    /// Nested transactions are flat-merged: only the outermost `commit`
    /// materializes. Cleanup always runs, even when the commit itself
    /// fails; collections then observe `committed = false` and the error
    /// propagates.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut handle_guard = self.txn_handle.lock();
        let level = self.txn_level.load(Ordering::Acquire);
        if level == 0 {
            return Err(Error::NotInTransaction);
        }
        self.txn_level.store(level - 1, Ordering::Release);
        if level > 1 {
            return Ok(());
        }

        let mut handle = handle_guard.take().ok_or(Error::NotInTransaction)?;
        drop(handle_guard);

        let result = if commit {
            handle.commit().map(|_| ())
        } else {
            handle.abort()
        };
        match result {
            Ok(()) => {
                self.cleanup_transaction(commit);
                Ok(())
            }
            Err(e) => {
                self.cleanup_transaction(false);
                Err(e.into())
            }
        }
    }

    fn cleanup_transaction(&self, committed: bool) {
        for coll in self.open_collections() {
            coll.transaction_ending(committed);
        }
        debug!(committed, "transaction ended");
    }

    /// Runs `f` inside a transaction, committing on `Ok` and aborting on
    /// `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        match f() {
            Ok(value) => {
                self.end_transaction(true)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.end_transaction(false);
                Err(e)
            }
        }
    }

    /// Whether a transaction is open on this handle.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.txn_level.load(Ordering::Acquire) > 0
    }

    /// Errors with `NotInTransaction` unless a transaction is open.
    pub fn must_be_in_transaction(&self) -> Result<()> {
        if self.is_in_transaction() {
            Ok(())
        } else {
            Err(Error::NotInTransaction)
        }
    }

    /// Errors with `TransactionNotClosed` if a transaction is open.
    pub fn must_not_be_in_transaction(&self) -> Result<()> {
        if self.is_in_transaction() {
            Err(Error::TransactionNotClosed)
        } else {
            Ok(())
        }
    }

    /// Runs `f` with the open transaction handle.
    pub(crate) fn with_txn<T>(
        &self,
        f: impl FnOnce(&mut dyn ExclusiveTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut handle = self.txn_handle.lock();
        let txn = handle.as_deref_mut().ok_or(Error::NotInTransaction)?;
        f(txn)
    }

    /// Reads a record, observing staged writes when a transaction is open.
    pub(crate) fn read_record(
        &self,
        store_name: &str,
        key: &[u8],
        store: &dyn KeyStore,
    ) -> Result<Option<Record>> {
        let handle = self.txn_handle.lock();
        if let Some(txn) = handle.as_deref() {
            return Ok(txn.get(store_name, key)?);
        }
        drop(handle);
        Ok(store.get(key)?)
    }

    // -----------------------------------------------------------------
    // Raw documents

    fn check_raw_store_name(store_name: &str) -> Result<()> {
        if key_store_name_to_collection_name(store_name).is_some() {
            return Err(Error::invalid_parameter(format!(
                "'{store_name}' is not a valid raw-document store name"
            )));
        }
        Ok(())
    }

    /// Reads a raw document from a named metadata store.
    pub fn get_raw_document(&self, store_name: &str, key: &[u8]) -> Result<Option<Record>> {
        self.ensure_open()?;
        Self::check_raw_store_name(store_name)?;
        let store = self
            .data_file
            .key_store(store_name, SequenceMode::NoSequences)?;
        self.read_record(store_name, key, &*store)
    }

    /// Writes (or, with an empty meta and body, deletes) a raw document.
    ///
    /// Runs its own transaction.
    pub fn put_raw_document(
        &self,
        store_name: &str,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        Self::check_raw_store_name(store_name)?;
        self.data_file
            .key_store(store_name, SequenceMode::NoSequences)?;
        self.transaction(|| {
            self.with_txn(|txn| {
                if meta.is_empty() && body.is_empty() {
                    txn.delete(store_name, key)?;
                } else {
                    txn.set(store_name, key, meta, body)?;
                }
                Ok(())
            })
        })
    }

    // -----------------------------------------------------------------
    // Blobs

    /// The database's blob store, created lazily under `Attachments/`.
    pub fn blob_store(&self) -> Result<Arc<BlobStore>> {
        self.ensure_open()?;
        let mut blob_store = self.blob_store.lock();
        if let Some(store) = blob_store.as_ref() {
            return Ok(Arc::clone(store));
        }
        let encrypted = self.current_key.lock().is_some();
        let store = Arc::new(BlobStore::open(
            &self.bundle.attachments_path(),
            encrypted,
            true,
        )?);
        *blob_store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Deletes every blob that no document references.
    ///
    /// Holds the storage layer's exclusive transaction so no blob can be
    /// created mid-sweep. Returns the number of blobs deleted.
    pub fn garbage_collect_blobs(&self) -> Result<u64> {
        self.ensure_open()?;
        self.must_not_be_in_transaction()?;
        let guard = self.data_file.begin_exclusive()?;

        let mut used = HashSet::new();
        for name in self.collection_names()? {
            if let Some(coll) = self.get_or_create_collection(&name, false)? {
                coll.find_blob_references(&mut |dict| {
                    if let Some(key) = BlobKey::from_digest_property(dict) {
                        used.insert(key);
                    }
                    true
                })?;
            }
        }
        let deleted = self.blob_store()?.delete_all_except(&used)?;
        drop(guard);

        if deleted > 0 || !used.is_empty() {
            info!(deleted, referenced = used.len(), "blob garbage collection");
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------
    // Misc accessors

    /// The maximum revision-tree depth, read from the info store.
    pub fn max_rev_tree_depth(&self) -> Result<u32> {
        let cached = self.max_rev_tree_depth.load(Ordering::Relaxed);
        if cached != 0 {
            return Ok(cached);
        }
        let stored = self
            .get_info_u64(crate::info::KEY_MAX_REV_TREE_DEPTH)?
            .unwrap_or(0) as u32;
        let depth = if stored == 0 {
            crate::info::DEFAULT_MAX_REV_TREE_DEPTH
        } else {
            stored
        };
        self.max_rev_tree_depth.store(depth, Ordering::Relaxed);
        Ok(depth)
    }

    /// Persists a new maximum revision-tree depth (0 restores the
    /// default).
    pub fn set_max_rev_tree_depth(&self, depth: u32) -> Result<()> {
        let depth = if depth == 0 {
            crate::info::DEFAULT_MAX_REV_TREE_DEPTH
        } else {
            depth
        };
        let stored = self
            .get_info_u64(crate::info::KEY_MAX_REV_TREE_DEPTH)?
            .unwrap_or(0) as u32;
        if stored != depth {
            self.transaction(|| {
                self.set_info_u64(crate::info::KEY_MAX_REV_TREE_DEPTH, u64::from(depth))
            })?;
        }
        self.max_rev_tree_depth.store(depth, Ordering::Relaxed);
        Ok(())
    }

    /// The earliest document expiration across all collections.
    pub fn next_doc_expiration(&self) -> Result<Option<Timestamp>> {
        let mut earliest: Option<Timestamp> = None;
        for name in self.collection_names()? {
            if let Some(coll) = self.get_or_create_collection(&name, false)? {
                if let Some(when) = coll.next_expiration()? {
                    earliest = Some(earliest.map_or(when, |e| e.min(when)));
                }
            }
        }
        Ok(earliest)
    }

    pub(crate) fn peer_id_cache(&self) -> &AtomicU64 {
        &self.peer_id
    }

    pub(crate) fn data_file(&self) -> &dyn DataFile {
        &*self.data_file
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.bundle.path())
            .field("is_open", &self.is_open())
            .field("in_transaction", &self.is_in_transaction())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_codec::Value;
    use tempfile::tempdir;

    fn open_new(path: &Path) -> Arc<Database> {
        Database::open(path, DatabaseConfig::new().create_if_missing(true)).unwrap()
    }

    fn doc(text: &str) -> Value {
        Value::map(vec![("text".into(), Value::Text(text.into()))])
    }

    #[test]
    fn open_creates_bundle_and_default_collection() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let db = open_new(&path);

        assert!(path.is_dir());
        assert!(path.join("db.shale").is_file());
        assert_eq!(db.collection_names().unwrap(), vec!["_default"]);
        assert!(db.collection("_default").unwrap().is_some());
    }

    #[test]
    fn reopen_without_create_fails_when_missing() {
        let temp = tempdir().unwrap();
        let result = Database::open(&temp.path().join("absent"), DatabaseConfig::new());
        assert!(result.is_err());
    }

    #[test]
    fn put_and_get_document() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("notes").unwrap();

        db.transaction(|| coll.put("n1", &doc("hello"))).unwrap();

        let body = coll.get("n1").unwrap().unwrap();
        assert_eq!(body.get("text").and_then(Value::as_text), Some("hello"));
        assert_eq!(coll.document_count().unwrap(), 1);
    }

    #[test]
    fn put_outside_transaction_fails() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("notes").unwrap();
        assert!(matches!(
            coll.put("n1", &doc("x")),
            Err(Error::NotInTransaction)
        ));
    }

    #[test]
    fn nested_transactions_flat_merge() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("notes").unwrap();

        db.begin_transaction().unwrap();
        db.begin_transaction().unwrap();
        coll.put("n1", &doc("inner")).unwrap();
        db.end_transaction(true).unwrap();
        assert!(db.is_in_transaction());
        // Inner commit does not materialize yet.
        db.end_transaction(true).unwrap();
        assert!(!db.is_in_transaction());

        assert!(coll.get("n1").unwrap().is_some());
    }

    #[test]
    fn abort_discards_writes() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("notes").unwrap();

        db.begin_transaction().unwrap();
        coll.put("n1", &doc("gone")).unwrap();
        db.end_transaction(false).unwrap();

        assert!(coll.get("n1").unwrap().is_none());
    }

    #[test]
    fn end_without_begin_is_an_error() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        assert!(matches!(
            db.end_transaction(true),
            Err(Error::NotInTransaction)
        ));
    }

    #[test]
    fn uncommitted_writes_visible_within_transaction() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("notes").unwrap();

        db.begin_transaction().unwrap();
        coll.put("n1", &doc("staged")).unwrap();
        assert!(coll.get("n1").unwrap().is_some());
        db.end_transaction(false).unwrap();
    }

    #[test]
    fn close_refuses_during_transaction() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        db.begin_transaction().unwrap();
        assert!(matches!(db.close(), Err(Error::TransactionNotClosed)));
        db.end_transaction(false).unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
    }

    #[test]
    fn operations_after_close_fail() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        db.close().unwrap();
        assert!(matches!(db.collection_names(), Err(Error::NotOpen)));
        assert!(matches!(db.begin_transaction(), Err(Error::NotOpen)));
    }

    #[test]
    fn collection_lookup_vs_create() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));

        assert!(db.collection("orders").unwrap().is_none());
        let created = db.create_collection("orders").unwrap();
        assert_eq!(created.name(), "orders");
        assert!(db.collection("orders").unwrap().is_some());
        assert!(db.has_collection("orders").unwrap());

        // Invalid names: create raises, lookup returns None.
        assert!(matches!(
            db.create_collection("_secret"),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            db.create_collection(""),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            db.create_collection("a/b"),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(db.collection("_secret").unwrap().is_none());
        assert!(db.collection("a/b").unwrap().is_none());
    }

    #[test]
    fn empty_name_is_not_a_collection() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        assert!(db.collection("").unwrap().is_none());
        assert!(matches!(
            db.create_collection(""),
            Err(Error::InvalidParameter { .. })
        ));
        // The default collection is addressed by its sentinel name.
        assert_eq!(db.default_collection().unwrap().name(), "_default");
    }

    #[test]
    fn delete_collection_removes_store() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let coll = db.create_collection("orders").unwrap();
        db.transaction(|| coll.put("o1", &doc("x"))).unwrap();

        db.delete_collection("orders").unwrap();
        assert!(!db.has_collection("orders").unwrap());
        assert!(db.collection("orders").unwrap().is_none());

        assert!(matches!(
            db.delete_collection("_default"),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn collection_object_is_unique_per_name() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let a = db.create_collection("orders").unwrap();
        let b = db.create_collection("orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn raw_documents_round_trip() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));

        db.put_raw_document(LOCAL_CHECKPOINT_STORE, b"cp1", b"meta", b"body")
            .unwrap();
        let rec = db
            .get_raw_document(LOCAL_CHECKPOINT_STORE, b"cp1")
            .unwrap()
            .unwrap();
        assert_eq!(rec.meta, b"meta");
        assert_eq!(rec.body, b"body");

        // Empty meta+body deletes.
        db.put_raw_document(LOCAL_CHECKPOINT_STORE, b"cp1", b"", b"")
            .unwrap();
        assert!(db
            .get_raw_document(LOCAL_CHECKPOINT_STORE, b"cp1")
            .unwrap()
            .is_none());

        // Stores that encode collection names are rejected.
        assert!(matches!(
            db.put_raw_document("coll_orders", b"k", b"", b"v"),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn max_rev_tree_depth_defaults_and_persists() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        assert_eq!(db.max_rev_tree_depth().unwrap(), 20);

        db.set_max_rev_tree_depth(40).unwrap();
        assert_eq!(db.max_rev_tree_depth().unwrap(), 40);

        db.set_max_rev_tree_depth(0).unwrap();
        assert_eq!(db.max_rev_tree_depth().unwrap(), 20);
    }

    #[test]
    fn close_and_delete_removes_bundle() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let db = open_new(&path);
        db.close_and_delete().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn blob_gc_keeps_referenced_blobs() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        let blobs = db.blob_store().unwrap();

        let referenced = blobs.put(b"kept blob").unwrap();
        let orphan = blobs.put(b"orphan blob").unwrap();

        let coll = db.create_collection("docs").unwrap();
        let body = Value::map(vec![(
            "attachment".into(),
            Value::map(vec![(
                "digest".into(),
                Value::Text(referenced.digest_string()),
            )]),
        )]);
        db.transaction(|| coll.put("d1", &body)).unwrap();

        let deleted = db.garbage_collect_blobs().unwrap();
        assert_eq!(deleted, 1);
        assert!(blobs.has(&referenced));
        assert!(!blobs.has(&orphan));
    }

    #[test]
    fn gc_refuses_inside_transaction() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));
        db.begin_transaction().unwrap();
        assert!(matches!(
            db.garbage_collect_blobs(),
            Err(Error::TransactionNotClosed)
        ));
        db.end_transaction(false).unwrap();
    }
}
