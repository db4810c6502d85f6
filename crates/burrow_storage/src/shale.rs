//! The built-in `shale` storage engine.
//!
//! Shale keeps each database in a single `db.shale` file: a small versioned
//! header followed by one codec-encoded frame holding every key-store. State
//! is shared in-process per path, so a foreground and a background handle on
//! the same physical file observe each other's commits immediately; cross-
//! handle commit notification is delivered through [`CommitListener`]s.
//!
//! Shale is deliberately simple: it exists so the core (and its tests) have
//! a complete engine behind the seam. Full query compilation is left to
//! query-capable engines; shale only implements
//! [`QueryLanguage::StoreScan`].

use crate::data_file::{
    ChangedStore, CommitInfo, CommitListener, DataFile, ExclusiveTransaction, KeyStore,
    MaintenanceKind, OpenOptions, Record, SequenceMode, Timestamp,
};
use crate::engine::StorageEngine;
use crate::error::{StorageError, StorageResult};
use crate::key::EncryptionKey;
use crate::query::{Query, QueryEnumerator, QueryLanguage, QueryOptions, QueryRow};
use burrow_codec::{decode, encode, Value};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Registry name of the built-in engine.
pub const SHALE_ENGINE_NAME: &str = "shale";

const EXTENSION: &str = "shale";
const MAGIC: &[u8; 8] = b"SHALEDB\0";
const FORMAT_VERSION: u16 = 2;
const FLAG_ENCRYPTED: u8 = 0x01;

// ---------------------------------------------------------------------------
// Shared per-path state

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredRecord {
    meta: Vec<u8>,
    body: Vec<u8>,
    sequence: u64,
    expiration: Option<Timestamp>,
}

#[derive(Debug, Clone)]
struct StoreState {
    mode: SequenceMode,
    last_sequence: u64,
    records: BTreeMap<Vec<u8>, StoredRecord>,
}

impl StoreState {
    fn new(mode: SequenceMode) -> Self {
        Self {
            mode,
            last_sequence: 0,
            records: BTreeMap::new(),
        }
    }

    fn bump_sequence(&mut self) -> u64 {
        match self.mode {
            SequenceMode::Sequenced => {
                self.last_sequence += 1;
                self.last_sequence
            }
            SequenceMode::NoSequences => 0,
        }
    }
}

struct FileState {
    stores: BTreeMap<String, StoreState>,
    key: Option<EncryptionKey>,
    writer_active: bool,
    listeners: Vec<(u64, Weak<dyn CommitListener>)>,
    deleted: bool,
}

struct Shared {
    path: PathBuf,
    state: Mutex<FileState>,
    writer_cv: Condvar,
}

fn open_files() -> &'static Mutex<HashMap<PathBuf, Weak<Shared>>> {
    static OPEN: OnceLock<Mutex<HashMap<PathBuf, Weak<Shared>>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_handle_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Engine

/// The built-in file-persisted engine.
#[derive(Debug, Default)]
pub struct ShaleEngine {
    _private: (),
}

impl ShaleEngine {
    /// Creates the engine capability.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for ShaleEngine {
    fn name(&self) -> &str {
        SHALE_ENGINE_NAME
    }

    fn display_name(&self) -> &str {
        "Shale"
    }

    fn extension(&self) -> &str {
        EXTENSION
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn open_file(&self, path: &Path, options: &OpenOptions) -> StorageResult<Box<dyn DataFile>> {
        let mut open = open_files().lock();
        open.retain(|_, weak| weak.strong_count() > 0);

        let shared = if let Some(existing) = open.get(path).and_then(Weak::upgrade) {
            existing
        } else {
            let (stores, key) = if path.exists() {
                load_file(path, options)?
            } else if options.create {
                let stores = BTreeMap::new();
                write_file(path, &stores, options.encryption_key.as_ref())?;
                (stores, options.encryption_key.clone())
            } else {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no data file at {}", path.display()),
                )));
            };
            let shared = Arc::new(Shared {
                path: path.to_path_buf(),
                state: Mutex::new(FileState {
                    stores,
                    key,
                    writer_active: false,
                    listeners: Vec::new(),
                    deleted: false,
                }),
                writer_cv: Condvar::new(),
            });
            open.insert(path.to_path_buf(), Arc::downgrade(&shared));
            shared
        };

        debug!(path = %path.display(), "opened shale data file handle");
        Ok(Box::new(ShaleDataFile {
            shared,
            handle_id: next_handle_id(),
            open: AtomicBool::new(true),
            writeable: options.writeable,
        }))
    }

    fn upgrade_file(&self, path: &Path, _options: &OpenOptions) -> StorageResult<()> {
        let raw = fs::read(path)?;
        let (version, flags, payload) = split_header(&raw)?;
        match version {
            FORMAT_VERSION => Ok(()),
            1 => {
                // v1 payloads are frame-compatible; only the header changes.
                let mut out = Vec::with_capacity(raw.len());
                out.extend_from_slice(MAGIC);
                out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
                out.push(flags);
                out.extend_from_slice(payload);
                atomic_write(path, &out)?;
                debug!(path = %path.display(), from = version, "upgraded shale file format");
                Ok(())
            }
            other => Err(StorageError::wrong_format(format!(
                "cannot upgrade shale file from v{other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// File format

fn split_header(raw: &[u8]) -> StorageResult<(u16, u8, &[u8])> {
    if raw.len() < MAGIC.len() + 3 || &raw[..MAGIC.len()] != MAGIC {
        return Err(StorageError::wrong_format("not a shale data file"));
    }
    let version = u16::from_be_bytes([raw[8], raw[9]]);
    let flags = raw[10];
    Ok((version, flags, &raw[11..]))
}

fn load_file(
    path: &Path,
    options: &OpenOptions,
) -> StorageResult<(BTreeMap<String, StoreState>, Option<EncryptionKey>)> {
    let raw = fs::read(path)?;
    let (version, flags, payload) = split_header(&raw)?;
    if version > FORMAT_VERSION {
        return Err(StorageError::wrong_format(format!(
            "shale file v{version} is newer than this build (v{FORMAT_VERSION})"
        )));
    }
    if version < FORMAT_VERSION {
        return Err(StorageError::DatabaseTooOld {
            found: version,
            need: FORMAT_VERSION,
        });
    }

    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let plaintext = if encrypted {
        let Some(key) = options.encryption_key.as_ref() else {
            return Err(StorageError::EncryptionFailed {
                message: "data file is encrypted and no key was given".into(),
            });
        };
        decrypt_payload(key, payload)?
    } else {
        if options.encryption_key.is_some() {
            return Err(StorageError::EncryptionFailed {
                message: "a key was given but the data file is not encrypted".into(),
            });
        }
        payload.to_vec()
    };

    let stores = stores_from_value(&decode(&plaintext)?)?;
    Ok((stores, options.encryption_key.clone()))
}

fn write_file(
    path: &Path,
    stores: &BTreeMap<String, StoreState>,
    key: Option<&EncryptionKey>,
) -> StorageResult<()> {
    let plaintext = encode(&stores_to_value(stores));
    let (flags, payload) = match key {
        Some(key) => (FLAG_ENCRYPTED, encrypt_payload(key, &plaintext)?),
        None => (0, plaintext),
    };
    let mut out = Vec::with_capacity(payload.len() + 11);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&payload);
    atomic_write(path, &out)
}

/// Write-then-rename so a crash never leaves a torn file.
fn atomic_write(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("shale.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(feature = "encryption")]
fn encrypt_payload(key: &EncryptionKey, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    crate::encrypted::encrypt(key, plaintext)
}

#[cfg(feature = "encryption")]
fn decrypt_payload(key: &EncryptionKey, data: &[u8]) -> StorageResult<Vec<u8>> {
    crate::encrypted::decrypt(key, data)
}

#[cfg(not(feature = "encryption"))]
fn encrypt_payload(_key: &EncryptionKey, _plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    Err(StorageError::EncryptionNotSupported)
}

#[cfg(not(feature = "encryption"))]
fn decrypt_payload(_key: &EncryptionKey, _data: &[u8]) -> StorageResult<Vec<u8>> {
    Err(StorageError::EncryptionNotSupported)
}

fn stores_to_value(stores: &BTreeMap<String, StoreState>) -> Value {
    let entries = stores
        .iter()
        .map(|(name, store)| {
            let records = store
                .records
                .iter()
                .map(|(key, rec)| {
                    let mut fields = vec![
                        ("k".to_string(), Value::Bytes(key.clone())),
                        ("m".to_string(), Value::Bytes(rec.meta.clone())),
                        ("b".to_string(), Value::Bytes(rec.body.clone())),
                        ("s".to_string(), Value::Int(rec.sequence as i64)),
                    ];
                    if let Some(exp) = rec.expiration {
                        fields.push(("x".to_string(), Value::Int(exp as i64)));
                    }
                    Value::map(fields)
                })
                .collect();
            let mode = match store.mode {
                SequenceMode::Sequenced => 0,
                SequenceMode::NoSequences => 1,
            };
            (
                name.clone(),
                Value::map(vec![
                    ("mode".to_string(), Value::Int(mode)),
                    ("seq".to_string(), Value::Int(store.last_sequence as i64)),
                    ("recs".to_string(), Value::Array(records)),
                ]),
            )
        })
        .collect();
    Value::map(entries)
}

fn stores_from_value(value: &Value) -> StorageResult<BTreeMap<String, StoreState>> {
    let entries = value
        .as_map()
        .ok_or_else(|| StorageError::corrupt("store table is not a map"))?;
    let mut stores = BTreeMap::new();
    for (name, store_val) in entries {
        let mode = match store_val.get("mode").and_then(Value::as_int) {
            Some(0) => SequenceMode::Sequenced,
            Some(1) => SequenceMode::NoSequences,
            _ => return Err(StorageError::corrupt(format!("bad mode in store '{name}'"))),
        };
        let last_sequence = store_val
            .get("seq")
            .and_then(Value::as_u64)
            .ok_or_else(|| StorageError::corrupt(format!("bad sequence in store '{name}'")))?;
        let mut records = BTreeMap::new();
        for rec in store_val
            .get("recs")
            .and_then(Value::as_array)
            .ok_or_else(|| StorageError::corrupt(format!("bad records in store '{name}'")))?
        {
            let field = |f: &str| rec.get(f).and_then(Value::as_bytes).map(<[u8]>::to_vec);
            let (Some(key), Some(meta), Some(body)) = (field("k"), field("m"), field("b")) else {
                return Err(StorageError::corrupt(format!(
                    "malformed record in store '{name}'"
                )));
            };
            let sequence = rec.get("s").and_then(Value::as_u64).unwrap_or(0);
            let expiration = rec.get("x").and_then(Value::as_u64);
            records.insert(
                key,
                StoredRecord {
                    meta,
                    body,
                    sequence,
                    expiration,
                },
            );
        }
        stores.insert(
            name.clone(),
            StoreState {
                mode,
                last_sequence,
                records,
            },
        );
    }
    Ok(stores)
}

// ---------------------------------------------------------------------------
// DataFile handle

struct ShaleDataFile {
    shared: Arc<Shared>,
    handle_id: u64,
    open: AtomicBool,
    writeable: bool,
}

impl ShaleDataFile {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotOpen)
        }
    }
}

impl DataFile for ShaleDataFile {
    fn path(&self) -> &Path {
        &self.shared.path
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn key_store(&self, name: &str, mode: SequenceMode) -> StorageResult<Arc<dyn KeyStore>> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let store = state
            .stores
            .entry(name.to_string())
            .or_insert_with(|| StoreState::new(mode));
        if store.mode != mode {
            return Err(StorageError::invalid_operation(format!(
                "key-store '{name}' was created with a different sequence mode"
            )));
        }
        Ok(Arc::new(ShaleKeyStore {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        }))
    }

    fn key_store_exists(&self, name: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.shared.state.lock().stores.contains_key(name))
    }

    fn all_key_store_names(&self) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.shared.state.lock().stores.keys().cloned().collect())
    }

    fn begin_exclusive(&self) -> StorageResult<Box<dyn ExclusiveTransaction>> {
        self.ensure_open()?;
        if !self.writeable {
            return Err(StorageError::invalid_operation(
                "data file is open read-only",
            ));
        }
        let mut state = self.shared.state.lock();
        while state.writer_active {
            self.shared.writer_cv.wait(&mut state);
        }
        state.writer_active = true;
        drop(state);
        Ok(Box::new(ShaleTransaction {
            shared: Arc::clone(&self.shared),
            handle_id: self.handle_id,
            staged: Vec::new(),
            finished: false,
        }))
    }

    fn compile_query(
        &self,
        expression: &str,
        language: QueryLanguage,
    ) -> StorageResult<Box<dyn Query>> {
        self.ensure_open()?;
        match language {
            QueryLanguage::StoreScan => Ok(Box::new(ShaleQuery {
                shared: Arc::clone(&self.shared),
                expression: expression.to_string(),
            })),
            QueryLanguage::Json => Err(StorageError::unimplemented(
                "the shale engine does not compile JSON queries",
            )),
        }
    }

    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        let mut state = self.shared.state.lock();
        state
            .listeners
            .push((self.handle_id, Arc::downgrade(&listener)));
    }

    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>) {
        let mut state = self.shared.state.lock();
        state.listeners.retain(|(_, weak)| {
            weak.upgrade()
                .map_or(false, |live| !Arc::ptr_eq(&live, listener))
        });
    }

    fn maintenance(&self, kind: MaintenanceKind) -> StorageResult<()> {
        self.ensure_open()?;
        // Shale has no dead space to reclaim; both kinds rewrite the file.
        let state = self.shared.state.lock();
        if !state.deleted {
            write_file(&self.shared.path, &state.stores, state.key.as_ref())?;
        }
        debug!(?kind, "shale maintenance complete");
        Ok(())
    }

    fn rekey(&self, key: Option<EncryptionKey>) -> StorageResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if state.writer_active {
            return Err(StorageError::invalid_operation(
                "cannot rekey during a transaction",
            ));
        }
        if key.is_some() && cfg!(not(feature = "encryption")) {
            return Err(StorageError::EncryptionNotSupported);
        }
        write_file(&self.shared.path, &state.stores, key.as_ref())?;
        state.key = key;
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        let handle_id = self.handle_id;
        state.listeners.retain(|(id, _)| *id != handle_id);
        if self.writeable && !state.deleted {
            write_file(&self.shared.path, &state.stores, state.key.as_ref())?;
        }
        Ok(())
    }

    fn delete_data_file(&self) -> StorageResult<()> {
        self.open.store(false, Ordering::Release);
        let mut state = self.shared.state.lock();
        state.deleted = true;
        state.stores.clear();
        state.listeners.clear();
        drop(state);
        open_files().lock().remove(&self.shared.path);
        match fs::remove_file(&self.shared.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ShaleDataFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ---------------------------------------------------------------------------
// KeyStore handle

struct ShaleKeyStore {
    shared: Arc<Shared>,
    name: String,
}

impl ShaleKeyStore {
    fn with_store<T>(&self, f: impl FnOnce(&StoreState) -> T) -> StorageResult<T> {
        let state = self.shared.state.lock();
        let store = state
            .stores
            .get(&self.name)
            .ok_or_else(|| StorageError::invalid_operation(format!("key-store '{}' was deleted", self.name)))?;
        Ok(f(store))
    }
}

impl KeyStore for ShaleKeyStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Record>> {
        self.with_store(|store| {
            store.records.get(key).map(|rec| Record {
                key: key.to_vec(),
                meta: rec.meta.clone(),
                body: rec.body.clone(),
                sequence: rec.sequence,
                expiration: rec.expiration,
            })
        })
    }

    fn last_sequence(&self) -> StorageResult<u64> {
        self.with_store(|store| store.last_sequence)
    }

    fn record_count(&self) -> StorageResult<u64> {
        self.with_store(|store| store.records.len() as u64)
    }

    fn next_expiration(&self) -> StorageResult<Option<Timestamp>> {
        self.with_store(|store| store.records.values().filter_map(|r| r.expiration).min())
    }

    fn scan(&self) -> StorageResult<Vec<Record>> {
        self.with_store(|store| {
            store
                .records
                .iter()
                .map(|(key, rec)| Record {
                    key: key.clone(),
                    meta: rec.meta.clone(),
                    body: rec.body.clone(),
                    sequence: rec.sequence,
                    expiration: rec.expiration,
                })
                .collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Exclusive transaction

enum StagedOp {
    Set {
        store: String,
        key: Vec<u8>,
        meta: Vec<u8>,
        body: Vec<u8>,
    },
    Delete {
        store: String,
        key: Vec<u8>,
    },
    SetExpiration {
        store: String,
        key: Vec<u8>,
        when: Option<Timestamp>,
    },
    Purge {
        store: String,
        key: Vec<u8>,
    },
    DeleteStore {
        store: String,
    },
}

struct ShaleTransaction {
    shared: Arc<Shared>,
    handle_id: u64,
    staged: Vec<StagedOp>,
    finished: bool,
}

impl ShaleTransaction {
    fn ensure_active(&self) -> StorageResult<()> {
        if self.finished {
            Err(StorageError::invalid_operation(
                "transaction already finished",
            ))
        } else {
            Ok(())
        }
    }

    fn release_writer(&mut self) {
        let mut state = self.shared.state.lock();
        state.writer_active = false;
        drop(state);
        self.shared.writer_cv.notify_one();
        self.finished = true;
    }

    /// Resolves a key against staged ops (latest wins), falling back to the
    /// committed state.
    fn staged_lookup(&self, store: &str, key: &[u8]) -> Option<Option<(Vec<u8>, Vec<u8>)>> {
        for op in self.staged.iter().rev() {
            match op {
                StagedOp::Set {
                    store: s,
                    key: k,
                    meta,
                    body,
                } if s == store && k == key => {
                    return Some(Some((meta.clone(), body.clone())));
                }
                StagedOp::Delete { store: s, key: k } | StagedOp::Purge { store: s, key: k }
                    if s == store && k == key =>
                {
                    return Some(None);
                }
                StagedOp::DeleteStore { store: s } if s == store => return Some(None),
                _ => {}
            }
        }
        None
    }

    fn key_exists(&self, store: &str, key: &[u8]) -> StorageResult<bool> {
        match self.staged_lookup(store, key) {
            Some(resolved) => Ok(resolved.is_some()),
            None => {
                let state = self.shared.state.lock();
                Ok(state
                    .stores
                    .get(store)
                    .is_some_and(|s| s.records.contains_key(key)))
            }
        }
    }
}

impl ExclusiveTransaction for ShaleTransaction {
    fn set(&mut self, store: &str, key: &[u8], meta: &[u8], body: &[u8]) -> StorageResult<()> {
        self.ensure_active()?;
        self.staged.push(StagedOp::Set {
            store: store.to_string(),
            key: key.to_vec(),
            meta: meta.to_vec(),
            body: body.to_vec(),
        });
        Ok(())
    }

    fn delete(&mut self, store: &str, key: &[u8]) -> StorageResult<bool> {
        self.ensure_active()?;
        if !self.key_exists(store, key)? {
            return Ok(false);
        }
        self.staged.push(StagedOp::Delete {
            store: store.to_string(),
            key: key.to_vec(),
        });
        Ok(true)
    }

    fn get(&self, store: &str, key: &[u8]) -> StorageResult<Option<Record>> {
        self.ensure_active()?;
        if let Some(resolved) = self.staged_lookup(store, key) {
            return Ok(resolved.map(|(meta, body)| Record {
                key: key.to_vec(),
                meta,
                body,
                sequence: 0,
                expiration: None,
            }));
        }
        let state = self.shared.state.lock();
        Ok(state.stores.get(store).and_then(|s| {
            s.records.get(key).map(|rec| Record {
                key: key.to_vec(),
                meta: rec.meta.clone(),
                body: rec.body.clone(),
                sequence: rec.sequence,
                expiration: rec.expiration,
            })
        }))
    }

    fn set_expiration(
        &mut self,
        store: &str,
        key: &[u8],
        when: Option<Timestamp>,
    ) -> StorageResult<bool> {
        self.ensure_active()?;
        if !self.key_exists(store, key)? {
            return Ok(false);
        }
        self.staged.push(StagedOp::SetExpiration {
            store: store.to_string(),
            key: key.to_vec(),
            when,
        });
        Ok(true)
    }

    fn expire_records(&mut self, store: &str, now: Timestamp) -> StorageResult<Vec<Vec<u8>>> {
        self.ensure_active()?;
        let expired: Vec<Vec<u8>> = {
            let state = self.shared.state.lock();
            state
                .stores
                .get(store)
                .map(|s| {
                    s.records
                        .iter()
                        .filter(|(_, rec)| rec.expiration.is_some_and(|exp| exp <= now))
                        .map(|(key, _)| key.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for key in &expired {
            self.staged.push(StagedOp::Purge {
                store: store.to_string(),
                key: key.clone(),
            });
        }
        Ok(expired)
    }

    fn delete_key_store(&mut self, store: &str) -> StorageResult<()> {
        self.ensure_active()?;
        self.staged.push(StagedOp::DeleteStore {
            store: store.to_string(),
        });
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<CommitInfo> {
        self.ensure_active()?;

        let mut state = self.shared.state.lock();
        // Apply against a copy so a failed persist leaves memory untouched.
        let mut stores = state.stores.clone();
        let mut touched: Vec<String> = Vec::new();
        let touch = |touched: &mut Vec<String>, name: &str| {
            if !touched.iter().any(|t| t == name) {
                touched.push(name.to_string());
            }
        };

        for op in &self.staged {
            match op {
                StagedOp::Set {
                    store,
                    key,
                    meta,
                    body,
                } => {
                    let entry = stores
                        .entry(store.clone())
                        .or_insert_with(|| StoreState::new(SequenceMode::Sequenced));
                    let sequence = entry.bump_sequence();
                    let expiration = entry.records.get(key).and_then(|r| r.expiration);
                    entry.records.insert(
                        key.clone(),
                        StoredRecord {
                            meta: meta.clone(),
                            body: body.clone(),
                            sequence,
                            expiration,
                        },
                    );
                    touch(&mut touched, store);
                }
                StagedOp::Delete { store, key } | StagedOp::Purge { store, key } => {
                    if let Some(entry) = stores.get_mut(store) {
                        if entry.records.remove(key).is_some() {
                            entry.bump_sequence();
                            touch(&mut touched, store);
                        }
                    }
                }
                StagedOp::SetExpiration { store, key, when } => {
                    if let Some(rec) =
                        stores.get_mut(store).and_then(|s| s.records.get_mut(key))
                    {
                        rec.expiration = *when;
                    }
                }
                StagedOp::DeleteStore { store } => {
                    stores.remove(store);
                }
            }
        }

        if !state.deleted {
            write_file(&self.shared.path, &stores, state.key.as_ref())?;
        }

        let changes: Vec<ChangedStore> = touched
            .iter()
            .filter_map(|name| {
                stores.get(name).map(|s| ChangedStore {
                    name: name.clone(),
                    last_sequence: s.last_sequence,
                })
            })
            .collect();

        state.stores = stores;
        state.writer_active = false;

        // Snapshot sibling listeners, then notify outside the lock.
        let handle_id = self.handle_id;
        let siblings: Vec<Arc<dyn CommitListener>> = state
            .listeners
            .iter()
            .filter(|(id, _)| *id != handle_id)
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        drop(state);
        self.shared.writer_cv.notify_one();
        self.finished = true;

        if !changes.is_empty() {
            for listener in siblings {
                listener.transaction_committed(&changes);
            }
        }

        Ok(CommitInfo {
            changed_stores: changes,
        })
    }

    fn abort(&mut self) -> StorageResult<()> {
        self.ensure_active()?;
        self.staged.clear();
        self.release_writer();
        Ok(())
    }
}

impl Drop for ShaleTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.release_writer();
        }
    }
}

// ---------------------------------------------------------------------------
// Queries

struct ShaleQuery {
    shared: Arc<Shared>,
    expression: String,
}

impl Query for ShaleQuery {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::StoreScan
    }

    fn create_enumerator(&self, options: &QueryOptions) -> StorageResult<QueryEnumerator> {
        let state = self.shared.state.lock();
        let Some(store) = state.stores.get(&self.expression) else {
            return Ok(QueryEnumerator::new(Vec::new(), 0, options.clone()));
        };
        let limit = options.limit.unwrap_or(u64::MAX) as usize;
        let rows = store
            .records
            .iter()
            .take(limit)
            .map(|(key, rec)| QueryRow {
                key: key.clone(),
                body: rec.body.clone(),
                sequence: rec.sequence,
            })
            .collect();
        Ok(QueryEnumerator::new(
            rows,
            store.last_sequence,
            options.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_file::DEFAULT_KEY_STORE;
    use tempfile::tempdir;

    fn open(path: &Path, create: bool) -> Box<dyn DataFile> {
        ShaleEngine::new()
            .open_file(
                path,
                &OpenOptions {
                    create,
                    writeable: true,
                    upgradeable: true,
                    encryption_key: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.shale");

        {
            let df = open(&path, true);
            let mut txn = df.begin_exclusive().unwrap();
            txn.set(DEFAULT_KEY_STORE, b"a", b"", b"body").unwrap();
            txn.commit().unwrap();
            df.close().unwrap();
        }

        let df = open(&path, false);
        let store = df
            .key_store(DEFAULT_KEY_STORE, SequenceMode::Sequenced)
            .unwrap();
        let rec = store.get(b"a").unwrap().unwrap();
        assert_eq!(rec.body, b"body");
        assert_eq!(rec.sequence, 1);
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let result = ShaleEngine::new().open_file(
            &dir.path().join("absent.shale"),
            &OpenOptions {
                create: false,
                writeable: true,
                ..OpenOptions::default()
            },
        );
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn staged_writes_visible_inside_transaction_only() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let store = df
            .key_store(DEFAULT_KEY_STORE, SequenceMode::Sequenced)
            .unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        txn.set(DEFAULT_KEY_STORE, b"k", b"", b"v").unwrap();
        assert!(txn.get(DEFAULT_KEY_STORE, b"k").unwrap().is_some());
        assert!(store.get(b"k").unwrap().is_none());

        txn.commit().unwrap();
        assert!(store.get(b"k").unwrap().is_some());
    }

    #[test]
    fn abort_discards_writes() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let store = df
            .key_store(DEFAULT_KEY_STORE, SequenceMode::Sequenced)
            .unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        txn.set(DEFAULT_KEY_STORE, b"k", b"", b"v").unwrap();
        txn.abort().unwrap();
        assert!(store.get(b"k").unwrap().is_none());
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn sequences_advance_per_mutation() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let store = df
            .key_store(DEFAULT_KEY_STORE, SequenceMode::Sequenced)
            .unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        txn.set(DEFAULT_KEY_STORE, b"a", b"", b"1").unwrap();
        txn.set(DEFAULT_KEY_STORE, b"b", b"", b"2").unwrap();
        txn.commit().unwrap();
        assert_eq!(store.last_sequence().unwrap(), 2);

        let mut txn = df.begin_exclusive().unwrap();
        assert!(txn.delete(DEFAULT_KEY_STORE, b"a").unwrap());
        txn.commit().unwrap();
        // Deletion is a mutation too.
        assert_eq!(store.last_sequence().unwrap(), 3);
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn sequence_less_store_stays_at_zero() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let store = df.key_store("info", SequenceMode::NoSequences).unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        txn.set("info", b"versioning", b"", b"\x01").unwrap();
        txn.commit().unwrap();

        assert_eq!(store.last_sequence().unwrap(), 0);
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn sibling_handles_share_state_and_get_notified() {
        use parking_lot::Mutex as PlMutex;

        struct Recorder(PlMutex<Vec<String>>);
        impl CommitListener for Recorder {
            fn transaction_committed(&self, changes: &[ChangedStore]) {
                let mut seen = self.0.lock();
                for c in changes {
                    seen.push(c.name.clone());
                }
            }
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("db.shale");
        let foreground = open(&path, true);
        let background = open(&path, false);

        let recorder = Arc::new(Recorder(PlMutex::new(Vec::new())));
        let listener: Arc<dyn CommitListener> = recorder.clone();
        background.add_commit_listener(Arc::clone(&listener));

        let mut txn = foreground.begin_exclusive().unwrap();
        txn.set("coll_orders", b"o1", b"", b"x").unwrap();
        txn.commit().unwrap();

        // Background handle sees the committed record and was notified.
        let store = background
            .key_store("coll_orders", SequenceMode::Sequenced)
            .unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
        assert_eq!(*recorder.0.lock(), vec!["coll_orders".to_string()]);

        // The committing handle's own listeners are not called.
        background.remove_commit_listener(&listener);
        foreground.add_commit_listener(Arc::clone(&listener));
        let mut txn = foreground.begin_exclusive().unwrap();
        txn.set("coll_orders", b"o2", b"", b"y").unwrap();
        txn.commit().unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn store_scan_query_tracks_sequences() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let mut txn = df.begin_exclusive().unwrap();
        txn.set("coll_q", b"a", b"", b"1").unwrap();
        txn.commit().unwrap();

        let query = df
            .compile_query("coll_q", QueryLanguage::StoreScan)
            .unwrap();
        let first = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.last_sequence(), 1);

        let again = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert!(!first.obsoleted_by(&again));

        let mut txn = df.begin_exclusive().unwrap();
        txn.set("coll_q", b"b", b"", b"2").unwrap();
        txn.commit().unwrap();
        let newer = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert!(first.obsoleted_by(&newer));
        assert_eq!(newer.len(), 2);
    }

    #[test]
    fn json_queries_are_unimplemented() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        assert!(matches!(
            df.compile_query("{}", QueryLanguage::Json),
            Err(StorageError::Unimplemented { .. })
        ));
    }

    #[test]
    fn expiration_round_trip() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let store = df.key_store("coll_e", SequenceMode::Sequenced).unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        txn.set("coll_e", b"doc", b"", b"v").unwrap();
        txn.commit().unwrap();

        let mut txn = df.begin_exclusive().unwrap();
        assert!(txn.set_expiration("coll_e", b"doc", Some(1000)).unwrap());
        assert!(!txn.set_expiration("coll_e", b"nope", Some(1000)).unwrap());
        txn.commit().unwrap();
        assert_eq!(store.next_expiration().unwrap(), Some(1000));

        let mut txn = df.begin_exclusive().unwrap();
        let purged = txn.expire_records("coll_e", 1000).unwrap();
        assert_eq!(purged, vec![b"doc".to_vec()]);
        txn.commit().unwrap();
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn old_format_reports_too_old_and_upgrades() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.shale");

        // Hand-craft a v1 file: old header, empty store table.
        let mut raw = Vec::new();
        raw.extend_from_slice(MAGIC);
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.push(0);
        raw.extend_from_slice(&encode(&Value::Map(Vec::new())));
        fs::write(&path, &raw).unwrap();

        let engine = ShaleEngine::new();
        let options = OpenOptions {
            create: false,
            writeable: true,
            upgradeable: true,
            encryption_key: None,
        };
        assert!(matches!(
            engine.open_file(&path, &options),
            Err(StorageError::DatabaseTooOld { found: 1, need: 2 })
        ));

        engine.upgrade_file(&path, &options).unwrap();
        let df = engine.open_file(&path, &options).unwrap();
        assert!(df.is_open());
    }

    #[test]
    fn garbage_file_is_wrong_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.shale");
        fs::write(&path, b"definitely not a database").unwrap();

        let result = ShaleEngine::new().open_file(
            &path,
            &OpenOptions {
                create: false,
                writeable: true,
                ..OpenOptions::default()
            },
        );
        assert!(matches!(result, Err(StorageError::WrongFormat { .. })));
    }

    #[test]
    fn delete_data_file_removes_and_allows_recreate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.shale");

        let df = open(&path, true);
        let mut txn = df.begin_exclusive().unwrap();
        txn.set(DEFAULT_KEY_STORE, b"a", b"", b"1").unwrap();
        txn.commit().unwrap();
        df.delete_data_file().unwrap();
        assert!(!path.exists());

        let df = open(&path, true);
        let store = df
            .key_store(DEFAULT_KEY_STORE, SequenceMode::Sequenced)
            .unwrap();
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn delete_key_store_drops_records() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        let mut txn = df.begin_exclusive().unwrap();
        txn.set("coll_gone", b"a", b"", b"1").unwrap();
        txn.commit().unwrap();
        assert!(df.key_store_exists("coll_gone").unwrap());

        let mut txn = df.begin_exclusive().unwrap();
        txn.delete_key_store("coll_gone").unwrap();
        txn.commit().unwrap();
        assert!(!df.key_store_exists("coll_gone").unwrap());
    }

    #[test]
    fn closed_handle_rejects_operations() {
        let dir = tempdir().unwrap();
        let df = open(&dir.path().join("db.shale"), true);
        df.close().unwrap();
        assert!(matches!(
            df.all_key_store_names(),
            Err(StorageError::NotOpen)
        ));
    }
}
