//! Database identity: persisted UUIDs and the derived peer ID.

use crate::database::Database;
use crate::error::Result;
use crate::info::{KEY_PREVIOUS_PRIVATE_UUID, KEY_PRIVATE_UUID, KEY_PUBLIC_UUID};
use std::sync::atomic::Ordering;
use tracing::info;
use uuid::Uuid;

/// Which of the database's two persistent UUIDs to address.
///
/// The public UUID may be shared with peers; the private UUID never leaves
/// the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    /// The shareable identity.
    Public,
    /// The local-only identity.
    Private,
}

impl UuidKind {
    fn key(self) -> &'static str {
        match self {
            UuidKind::Public => KEY_PUBLIC_UUID,
            UuidKind::Private => KEY_PRIVATE_UUID,
        }
    }
}

impl Database {
    fn stored_uuid(&self, key: &str) -> Result<Option<Uuid>> {
        Ok(self.read_info(key)?.and_then(|rec| {
            let bytes: [u8; 16] = rec.body.as_slice().try_into().ok()?;
            Some(Uuid::from_bytes(bytes))
        }))
    }

    /// Returns the stored UUID, generating and persisting one if absent.
    pub fn get_uuid(&self, kind: UuidKind) -> Result<Uuid> {
        if let Some(uuid) = self.stored_uuid(kind.key())? {
            return Ok(uuid);
        }
        self.transaction(|| self.generate_uuid(kind, false))
    }

    /// Generates (or, without `overwrite`, returns) a UUID inside the open
    /// transaction.
    pub(crate) fn generate_uuid(&self, kind: UuidKind, overwrite: bool) -> Result<Uuid> {
        self.must_be_in_transaction()?;
        if !overwrite {
            if let Some(existing) = self.stored_uuid(kind.key())? {
                return Ok(existing);
            }
        }
        let uuid = Uuid::new_v4();
        self.set_info(kind.key(), uuid.as_bytes())?;
        Ok(uuid)
    }

    /// Regenerates both UUIDs, stashing the old private UUID under
    /// `previousPrivateUUID`.
    pub fn reset_uuids(&self) -> Result<()> {
        self.transaction(|| {
            let previous = self.generate_uuid(UuidKind::Private, false)?;
            self.set_info(KEY_PREVIOUS_PRIVATE_UUID, previous.as_bytes())?;
            self.generate_uuid(UuidKind::Public, true)?;
            self.generate_uuid(UuidKind::Private, true)?;
            Ok(())
        })?;
        self.peer_id_cache().store(0, Ordering::Relaxed);
        info!("reset database UUIDs");
        Ok(())
    }

    /// The private UUID as it was before the last `reset_uuids`, if any.
    pub fn previous_private_uuid(&self) -> Result<Option<Uuid>> {
        self.stored_uuid(KEY_PREVIOUS_PRIVATE_UUID)
    }

    /// This database's 64-bit replication peer ID.
    ///
    /// Derived from the first 8 bytes of the public UUID, big-endian, and
    /// clamped to at least 1 so that 0 stays the "unknown peer" sentinel.
    pub fn my_peer_id(&self) -> Result<u64> {
        let cached = self.peer_id_cache().load(Ordering::Relaxed);
        if cached != 0 {
            return Ok(cached);
        }
        let uuid = self.get_uuid(UuidKind::Public)?;
        let mut first_half = [0u8; 8];
        first_half.copy_from_slice(&uuid.as_bytes()[..8]);
        let peer_id = u64::from_be_bytes(first_half).max(1);
        self.peer_id_cache().store(peer_id, Ordering::Relaxed);
        Ok(peer_id)
    }

    /// The peer ID formatted as lowercase hex.
    pub fn peer_id_hex(&self) -> Result<String> {
        Ok(format!("{:x}", self.my_peer_id()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_new(path: &std::path::Path) -> Arc<Database> {
        Database::open(path, DatabaseConfig::new().create_if_missing(true)).unwrap()
    }

    #[test]
    fn uuids_exist_after_create() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));

        let public = db.get_uuid(UuidKind::Public).unwrap();
        let private = db.get_uuid(UuidKind::Private).unwrap();
        assert_ne!(public, private);

        // Stable across calls.
        assert_eq!(db.get_uuid(UuidKind::Public).unwrap(), public);
    }

    #[test]
    fn uuids_persist_across_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");

        let (public, private) = {
            let db = open_new(&path);
            let ids = (
                db.get_uuid(UuidKind::Public).unwrap(),
                db.get_uuid(UuidKind::Private).unwrap(),
            );
            db.close().unwrap();
            ids
        };

        let db = Database::open(&path, DatabaseConfig::new()).unwrap();
        assert_eq!(db.get_uuid(UuidKind::Public).unwrap(), public);
        assert_eq!(db.get_uuid(UuidKind::Private).unwrap(), private);
    }

    #[test]
    fn reset_stashes_previous_private_uuid() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));

        let old_public = db.get_uuid(UuidKind::Public).unwrap();
        let old_private = db.get_uuid(UuidKind::Private).unwrap();

        db.reset_uuids().unwrap();

        assert_eq!(db.previous_private_uuid().unwrap(), Some(old_private));
        assert_ne!(db.get_uuid(UuidKind::Public).unwrap(), old_public);
        assert_ne!(db.get_uuid(UuidKind::Private).unwrap(), old_private);
    }

    #[test]
    fn peer_id_is_nonzero_and_matches_public_uuid() {
        let temp = tempdir().unwrap();
        let db = open_new(&temp.path().join("db"));

        let peer_id = db.my_peer_id().unwrap();
        assert!(peer_id >= 1);

        let public = db.get_uuid(UuidKind::Public).unwrap();
        let mut first_half = [0u8; 8];
        first_half.copy_from_slice(&public.as_bytes()[..8]);
        assert_eq!(peer_id, u64::from_be_bytes(first_half).max(1));

        assert_eq!(db.peer_id_hex().unwrap(), format!("{peer_id:x}"));
    }
}
