//! Typed accessors over the reserved metadata key-store.
//!
//! The `info` store has no sequence index and holds the database's own
//! bookkeeping records: versioning, UUIDs, the remote registry, and tuning
//! values. Unsigned values are stored as 8-byte big-endian bodies.

use crate::database::Database;
use crate::error::Result;
use burrow_storage::{Record, SequenceMode};

/// Name of the reserved metadata key-store.
pub const INFO_STORE: &str = "info";

/// Info key holding the document-versioning scheme (u64).
pub const KEY_VERSIONING: &str = "versioning";
/// Info key holding the maximum revision-tree depth (u64).
pub const KEY_MAX_REV_TREE_DEPTH: &str = "maxRevTreeDepth";
/// Info key holding the public UUID (16 bytes).
pub const KEY_PUBLIC_UUID: &str = "publicUUID";
/// Info key holding the private UUID (16 bytes).
pub const KEY_PRIVATE_UUID: &str = "privateUUID";
/// Info key holding the private UUID as it was before the last reset.
pub const KEY_PREVIOUS_PRIVATE_UUID: &str = "previousPrivateUUID";
/// Info key holding the remote-database registry.
pub const KEY_REMOTES: &str = "remotes";

/// Default maximum revision-tree depth.
pub const DEFAULT_MAX_REV_TREE_DEPTH: u32 = 20;

impl Database {
    /// Reads an info record, observing an open transaction's staged
    /// writes.
    pub(crate) fn read_info(&self, key: &str) -> Result<Option<Record>> {
        let store = self
            .data_file()
            .key_store(INFO_STORE, SequenceMode::NoSequences)?;
        self.read_record(INFO_STORE, key.as_bytes(), &*store)
    }

    /// Writes an info record. Requires an open transaction.
    pub(crate) fn set_info(&self, key: &str, body: &[u8]) -> Result<()> {
        self.with_txn(|txn| {
            txn.set(INFO_STORE, key.as_bytes(), b"", body)?;
            Ok(())
        })
    }

    /// Reads an unsigned info value.
    pub(crate) fn get_info_u64(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.read_info(key)?.and_then(|rec| {
            let bytes: [u8; 8] = rec.body.as_slice().try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }))
    }

    /// Writes an unsigned info value. Requires an open transaction.
    pub(crate) fn set_info_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set_info(key, &value.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use tempfile::tempdir;

    #[test]
    fn u64_round_trip() {
        let temp = tempdir().unwrap();
        let db = Database::open(
            &temp.path().join("db"),
            DatabaseConfig::new().create_if_missing(true),
        )
        .unwrap();

        assert_eq!(db.get_info_u64("tuningValue").unwrap(), None);
        db.transaction(|| db.set_info_u64("tuningValue", 77)).unwrap();
        assert_eq!(db.get_info_u64("tuningValue").unwrap(), Some(77));
    }

    #[test]
    fn staged_info_visible_inside_transaction() {
        let temp = tempdir().unwrap();
        let db = Database::open(
            &temp.path().join("db"),
            DatabaseConfig::new().create_if_missing(true),
        )
        .unwrap();

        db.begin_transaction().unwrap();
        db.set_info_u64("staged", 5).unwrap();
        assert_eq!(db.get_info_u64("staged").unwrap(), Some(5));
        db.end_transaction(false).unwrap();
        assert_eq!(db.get_info_u64("staged").unwrap(), None);
    }

    #[test]
    fn set_info_requires_transaction() {
        let temp = tempdir().unwrap();
        let db = Database::open(
            &temp.path().join("db"),
            DatabaseConfig::new().create_if_missing(true),
        )
        .unwrap();
        assert!(db.set_info_u64("nope", 1).is_err());
    }
}
