//! Collections and collection naming.
//!
//! A collection is a named set of documents backed by one key-store. The
//! default collection is named `_default` and maps to the storage engine's
//! default key-store; every other collection `name` maps to a key-store
//! named `coll_<name>`.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::housekeeper::Housekeeper;
use crate::sequence_tracker::SequenceTracker;
use burrow_codec::{decode, encode, Value};
use burrow_storage::{KeyStore, Timestamp, DEFAULT_KEY_STORE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Name of the default collection.
pub const DEFAULT_COLLECTION_NAME: &str = "_default";

const KEY_STORE_PREFIX: &str = "coll_";

/// Top-level document keys reserved by the engine.
const RESERVED_DOC_KEYS: [&str; 3] = ["_id", "_rev", "_deleted"];

/// Whether `name` is a legal collection name.
///
/// Legal names are 1–30 bytes of `[A-Za-z0-9_%-]` and do not begin with
/// `_` or `%`.
#[must_use]
pub fn collection_name_is_valid(name: &str) -> bool {
    let bytes = name.as_bytes();
    (1..=30).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'%' | b'-'))
        && bytes[0] != b'_'
        && bytes[0] != b'%'
}

/// Maps a collection name to its backing key-store name.
///
/// Returns `None` for invalid names.
#[must_use]
pub fn collection_name_to_key_store_name(name: &str) -> Option<String> {
    if name == DEFAULT_COLLECTION_NAME {
        Some(DEFAULT_KEY_STORE.to_string())
    } else if collection_name_is_valid(name) {
        Some(format!("{KEY_STORE_PREFIX}{name}"))
    } else {
        None
    }
}

/// Maps a key-store name back to the collection it backs, if any.
#[must_use]
pub fn key_store_name_to_collection_name(name: &str) -> Option<String> {
    if name == DEFAULT_KEY_STORE {
        Some(DEFAULT_COLLECTION_NAME.to_string())
    } else {
        let stripped = name.strip_prefix(KEY_STORE_PREFIX)?;
        collection_name_is_valid(stripped).then(|| stripped.to_string())
    }
}

/// A named set of documents within a database.
///
/// Collections are exclusively owned by their database and hold only a weak
/// back-reference to it; a collection must never be used past its
/// database's `close()`.
pub struct Collection {
    name: String,
    store_name: String,
    db: Weak<Database>,
    key_store: Arc<dyn KeyStore>,
    tracker: SequenceTracker,
    housekeeper: parking_lot::Mutex<Option<Housekeeper>>,
    closed: AtomicBool,
    self_ref: std::sync::OnceLock<Weak<Collection>>,
}

impl Collection {
    pub(crate) fn new(
        db: Weak<Database>,
        name: &str,
        store_name: &str,
        key_store: Arc<dyn KeyStore>,
    ) -> Result<Arc<Self>> {
        let last_sequence = key_store.last_sequence()?;
        debug!(collection = name, "instantiated");
        let collection = Arc::new(Self {
            name: name.to_string(),
            store_name: store_name.to_string(),
            db,
            key_store,
            tracker: SequenceTracker::new(store_name, last_sequence),
            housekeeper: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = collection.self_ref.set(Arc::downgrade(&collection));
        Ok(collection)
    }

    /// The collection's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing key-store.
    #[must_use]
    pub fn key_store_name(&self) -> &str {
        &self.store_name
    }

    fn database(&self) -> Result<Arc<Database>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        self.db.upgrade().ok_or(Error::NotOpen)
    }

    /// Number of live documents.
    pub fn document_count(&self) -> Result<u64> {
        self.database()?;
        Ok(self.key_store.record_count()?)
    }

    /// The backing store's last committed sequence.
    pub fn last_sequence(&self) -> Result<u64> {
        self.database()?;
        Ok(self.key_store.last_sequence()?)
    }

    /// Reads and decodes a document.
    pub fn get(&self, doc_id: &str) -> Result<Option<Value>> {
        let db = self.database()?;
        let record = db.read_record(&self.store_name, doc_id.as_bytes(), &*self.key_store)?;
        match record {
            Some(rec) => Ok(Some(decode(&rec.body)?)),
            None => Ok(None),
        }
    }

    /// Writes a document. Must be called inside a transaction.
    ///
    /// The body must be a map and must not use the engine's reserved
    /// top-level keys.
    pub fn put(&self, doc_id: &str, body: &Value) -> Result<()> {
        let db = self.database()?;
        db.must_be_in_transaction()?;
        validate_document_body(body)?;
        db.with_txn(|txn| {
            txn.set(&self.store_name, doc_id.as_bytes(), b"", &encode(body))?;
            Ok(())
        })?;
        self.tracker.document_changed();
        Ok(())
    }

    /// Deletes a document. Must be called inside a transaction.
    ///
    /// Returns false if the document does not exist.
    pub fn delete(&self, doc_id: &str) -> Result<bool> {
        let db = self.database()?;
        db.must_be_in_transaction()?;
        let existed = db.with_txn(|txn| Ok(txn.delete(&self.store_name, doc_id.as_bytes())?))?;
        if existed {
            self.tracker.document_changed();
        }
        Ok(existed)
    }

    /// Sets or clears a document's expiration time.
    ///
    /// Runs its own transaction. Returns false if the document does not
    /// exist. Setting a nonzero expiration starts the collection's
    /// housekeeper if needed.
    pub fn set_expiration(&self, doc_id: &str, when: Option<Timestamp>) -> Result<bool> {
        let db = self.database()?;
        let updated = db.transaction(|| {
            db.with_txn(|txn| Ok(txn.set_expiration(&self.store_name, doc_id.as_bytes(), when)?))
        })?;
        if !updated {
            return Ok(false);
        }
        if let Some(when) = when {
            let housekeeper = self.housekeeper.lock();
            if let Some(hk) = housekeeper.as_ref() {
                hk.document_expiration_changed(when);
            } else {
                drop(housekeeper);
                self.start_housekeeping();
            }
        }
        Ok(true)
    }

    /// The earliest expiration time of any document, if set.
    pub fn next_expiration(&self) -> Result<Option<Timestamp>> {
        self.database()?;
        Ok(self.key_store.next_expiration()?)
    }

    /// Purges all documents whose expiration has passed.
    ///
    /// Runs its own transaction; returns the number purged.
    pub fn purge_expired(&self) -> Result<u64> {
        let db = self.database()?;
        let now = crate::housekeeper::now_millis();
        let purged = db.transaction(|| {
            let purged =
                db.with_txn(|txn| Ok(txn.expire_records(&self.store_name, now)?))?;
            if !purged.is_empty() {
                self.tracker.document_changed();
            }
            Ok(purged)
        })?;
        if !purged.is_empty() {
            debug!(collection = %self.name, count = purged.len(), "purged expired documents");
        }
        Ok(purged.len() as u64)
    }

    /// Walks every document body and reports each nested dict carrying a
    /// `digest` property (a blob reference) to `callback`.
    ///
    /// The callback returns false to stop the walk early.
    pub fn find_blob_references(
        &self,
        callback: &mut dyn FnMut(&Value) -> bool,
    ) -> Result<()> {
        self.database()?;
        for record in self.key_store.scan()? {
            let body = decode(&record.body)?;
            if !walk_blob_refs(&body, callback) {
                break;
            }
        }
        Ok(())
    }

    // --- transaction callbacks, invoked by the database ---

    pub(crate) fn transaction_began(&self) {
        self.tracker.begin_transaction();
    }

    pub(crate) fn transaction_ending(&self, committed: bool) {
        let last_sequence = self.key_store.last_sequence().unwrap_or(0);
        self.tracker.end_transaction(committed, last_sequence);
    }

    pub(crate) fn external_transaction_committed(&self, last_sequence: u64) {
        self.tracker.add_external_transaction(last_sequence);
    }

    /// The tracker's view of the latest committed sequence.
    #[must_use]
    pub fn tracked_sequence(&self) -> u64 {
        self.tracker.last_sequence()
    }

    // --- housekeeping ---

    pub(crate) fn start_housekeeping(&self) {
        let Ok(db) = self.database() else { return };
        if db.config().read_only {
            return;
        }
        let Some(weak) = self.self_ref.get().cloned() else {
            return;
        };
        let mut housekeeper = self.housekeeper.lock();
        if housekeeper.is_none() {
            match Housekeeper::start(weak) {
                Ok(hk) => *housekeeper = Some(hk),
                Err(e) => warn!(collection = %self.name, error = %e, "housekeeper failed to start"),
            }
        }
    }

    /// Stops the expiration housekeeper. Returns false if none was running.
    ///
    /// Never call this while holding the database's collection-registry
    /// lock; the housekeeper thread may be blocked inside a database call.
    pub(crate) fn stop_housekeeping(&self) -> bool {
        let taken = self.housekeeper.lock().take();
        match taken {
            Some(hk) => {
                hk.stop();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        self.stop_housekeeping();
        self.closed.store(true, Ordering::Release);
        debug!(collection = %self.name, "closed");
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("key_store", &self.store_name)
            .finish_non_exhaustive()
    }
}

fn validate_document_body(body: &Value) -> Result<()> {
    let Some(entries) = body.as_map() else {
        return Err(Error::corrupt_revision_data("document body is not a map"));
    };
    for (key, _) in entries {
        if RESERVED_DOC_KEYS.contains(&key.as_str()) {
            return Err(Error::corrupt_revision_data(format!(
                "illegal top-level key `{key}` in document"
            )));
        }
    }
    Ok(())
}

/// Recursively visits nested dicts with a `digest` property.
fn walk_blob_refs(value: &Value, callback: &mut dyn FnMut(&Value) -> bool) -> bool {
    match value {
        Value::Map(entries) => {
            if value.get("digest").is_some() && !callback(value) {
                return false;
            }
            entries.iter().all(|(_, v)| walk_blob_refs(v, callback))
        }
        Value::Array(items) => items.iter().all(|v| walk_blob_refs(v, callback)),
        _ => true,
    }
}
