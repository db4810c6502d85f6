//! Database configuration.

use burrow_storage::EncryptionKey;

/// The document-versioning scheme a database uses.
///
/// Persisted in the `versioning` info record. A database whose stored scheme
/// is lower than the configured one is upgraded at open; a higher stored
/// scheme is adopted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Versioning {
    /// Revision trees.
    RevTrees,
    /// Version vectors.
    VersionVectors,
}

impl Versioning {
    /// Stable on-disk encoding.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Versioning::RevTrees => 1,
            Versioning::VersionVectors => 2,
        }
    }

    /// Decodes a stored scheme value.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(Versioning::RevTrees),
            2 => Some(Versioning::VersionVectors),
            _ => None,
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Create the bundle if it doesn't exist.
    pub create_if_missing: bool,

    /// Open read-only.
    pub read_only: bool,

    /// Refuse in-place format upgrades.
    pub no_upgrade: bool,

    /// Document-versioning scheme for new databases.
    pub versioning: Versioning,

    /// Storage engine name; empty selects the default engine.
    pub storage_engine: String,

    /// Encryption key for the data file and blob store.
    pub encryption_key: Option<EncryptionKey>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            read_only: false,
            no_upgrade: false,
            versioning: Versioning::RevTrees,
            storage_engine: String::new(),
            encryption_key: None,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the bundle if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Forbids in-place format upgrades.
    #[must_use]
    pub const fn no_upgrade(mut self, value: bool) -> Self {
        self.no_upgrade = value;
        self
    }

    /// Sets the versioning scheme.
    #[must_use]
    pub const fn versioning(mut self, value: Versioning) -> Self {
        self.versioning = value;
        self
    }

    /// Selects a storage engine by name.
    #[must_use]
    pub fn storage_engine(mut self, name: impl Into<String>) -> Self {
        self.storage_engine = name.into();
        self
    }

    /// Sets the encryption key.
    #[must_use]
    pub fn encryption_key(mut self, key: Option<EncryptionKey>) -> Self {
        self.encryption_key = key;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DatabaseConfig::default();
        assert!(!config.create_if_missing);
        assert!(!config.read_only);
        assert_eq!(config.versioning, Versioning::RevTrees);
        assert!(config.storage_engine.is_empty());
    }

    #[test]
    fn builder() {
        let config = DatabaseConfig::new()
            .create_if_missing(true)
            .versioning(Versioning::VersionVectors)
            .storage_engine("shale");
        assert!(config.create_if_missing);
        assert_eq!(config.versioning, Versioning::VersionVectors);
        assert_eq!(config.storage_engine, "shale");
    }

    #[test]
    fn versioning_round_trip() {
        for v in [Versioning::RevTrees, Versioning::VersionVectors] {
            assert_eq!(Versioning::from_u64(v.as_u64()), Some(v));
        }
        assert_eq!(Versioning::from_u64(0), None);
        assert!(Versioning::RevTrees < Versioning::VersionVectors);
    }
}
