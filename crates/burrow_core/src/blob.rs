//! Content-addressed blob store.
//!
//! Blobs live as individual files under the bundle's `Attachments/`
//! directory, keyed by the SHA-256 digest of their content. Document bodies
//! reference blobs through nested dicts carrying a `digest` property of the
//! form `sha256-<hex>`.

use crate::error::{Error, Result};
use burrow_codec::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const DIGEST_PREFIX: &str = "sha256-";
const BLOB_EXTENSION: &str = "blob";

/// A blob's content address: the SHA-256 digest of its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey([u8; 32]);

impl BlobKey {
    /// Computes the key for `content`.
    #[must_use]
    pub fn compute(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Parses a `sha256-<hex>` digest string.
    #[must_use]
    pub fn from_digest_string(digest: &str) -> Option<Self> {
        let hex = digest.strip_prefix(DIGEST_PREFIX)?;
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Extracts the key from a blob-reference dict's `digest` property.
    #[must_use]
    pub fn from_digest_property(blob_dict: &Value) -> Option<Self> {
        blob_dict
            .get("digest")
            .and_then(Value::as_text)
            .and_then(Self::from_digest_string)
    }

    /// The `sha256-<hex>` digest string.
    #[must_use]
    pub fn digest_string(&self) -> String {
        let mut s = String::with_capacity(DIGEST_PREFIX.len() + 64);
        s.push_str(DIGEST_PREFIX);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    fn file_name(&self) -> String {
        let mut s = String::with_capacity(64 + 5);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s.push('.');
        s.push_str(BLOB_EXTENSION);
        s
    }
}

/// A directory of content-addressed blobs.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    encrypted: bool,
}

impl BlobStore {
    /// Opens (and optionally creates) a blob store directory.
    ///
    /// `encrypted` records whether blob contents are encrypted; the cipher
    /// itself is applied by the caller's storage layer, the store only
    /// tracks addressing and files.
    pub fn open(dir: &Path, encrypted: bool, create: bool) -> Result<Self> {
        if !dir.exists() {
            if !create {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no blob store at {}", dir.display()),
                )));
            }
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            encrypted,
        })
    }

    /// The store's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether blob contents are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Stores `content`, returning its key. Idempotent.
    pub fn put(&self, content: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::compute(content);
        let path = self.dir.join(key.file_name());
        if !path.exists() {
            fs::write(&path, content)?;
        }
        Ok(key)
    }

    /// Reads a blob's content.
    pub fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(key.file_name())) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob exists.
    #[must_use]
    pub fn has(&self, key: &BlobKey) -> bool {
        self.dir.join(key.file_name()).exists()
    }

    /// Keys of every blob on disk.
    pub fn all_keys(&self) -> Result<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
            else {
                continue;
            };
            if let Some(key) = BlobKey::from_digest_string(&format!("{DIGEST_PREFIX}{stem}")) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Deletes every blob whose key is not in `keep`. Returns the count.
    pub fn delete_all_except(&self, keep: &HashSet<BlobKey>) -> Result<u64> {
        let mut deleted = 0;
        for key in self.all_keys()? {
            if !keep.contains(&key) {
                fs::remove_file(self.dir.join(key.file_name()))?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Copies every blob into `other` (used while building a rekeyed store).
    pub fn copy_blobs_to(&self, other: &BlobStore) -> Result<u64> {
        let mut copied = 0;
        for key in self.all_keys()? {
            if let Some(content) = self.get(&key)? {
                other.put(&content)?;
                copied += 1;
            }
        }
        debug!(copied, "copied blobs");
        Ok(copied)
    }

    /// Deletes the whole store directory.
    pub fn delete_store(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
