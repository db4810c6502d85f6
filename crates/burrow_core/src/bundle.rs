//! Database bundle layout.
//!
//! A database on disk is a directory (the "bundle"):
//!
//! ```text
//! <bundle>/
//! ├─ db.<ext>            # data file; <ext> comes from the storage engine
//! ├─ LOCK                # advisory lock for single-process access
//! ├─ Attachments/        # content-addressed blobs
//! └─ Attachments_temp/   # transient during rekey
//! ```

use crate::error::{Error, Result};
use burrow_storage::{engine_named, registered_engines, StorageEngine};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const DATA_FILE_STEM: &str = "db";
const ATTACHMENTS_DIR: &str = "Attachments";
const ATTACHMENTS_TEMP_DIR: &str = "Attachments_temp";

/// A located (and locked) database bundle.
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    data_file_path: PathBuf,
    _lock_file: File,
}

impl Bundle {
    /// Locates or creates a bundle and resolves its data file and engine.
    ///
    /// - With `can_create`, the directory is created if absent; otherwise it
    ///   must already exist as a directory.
    /// - A freshly created bundle uses the requested (or default) engine.
    /// - If an engine was explicitly requested and the bundle's data file
    ///   uses a different extension, the open fails with `WrongFormat`.
    /// - With no explicit engine, other registered engines' extensions are
    ///   probed before giving up.
    pub fn find_or_create(
        path: &Path,
        can_create: bool,
        engine_name: &str,
    ) -> Result<(Self, Arc<dyn StorageEngine>)> {
        let engine = engine_named(engine_name)?;
        let explicit = !engine_name.is_empty();

        let created_dir = if path.exists() {
            if !path.is_dir() {
                return Err(Error::wrong_format(format!(
                    "bundle path is not a directory: {}",
                    path.display()
                )));
            }
            false
        } else if can_create {
            fs::create_dir_all(path)?;
            true
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no database at {}", path.display()),
            )));
        };

        let lock_file = acquire_lock(path)?;

        let data_file_path = path.join(format!("{DATA_FILE_STEM}.{}", engine.extension()));
        if created_dir || engine.file_exists(&data_file_path) {
            let bundle = Self {
                path: path.to_path_buf(),
                data_file_path,
                _lock_file: lock_file,
            };
            return Ok((bundle, engine));
        }

        if explicit {
            // The bundle exists but not in the requested engine's format.
            return Err(Error::wrong_format(format!(
                "bundle does not contain a {} data file",
                engine.display_name()
            )));
        }

        // No explicit engine; probe the other registered engines.
        for other in registered_engines() {
            if other.name() == engine.name() {
                continue;
            }
            let candidate = path.join(format!("{DATA_FILE_STEM}.{}", other.extension()));
            if other.file_exists(&candidate) {
                let bundle = Self {
                    path: path.to_path_buf(),
                    data_file_path: candidate,
                    _lock_file: lock_file,
                };
                return Ok((bundle, other));
            }
        }

        Err(Error::wrong_format(
            "bundle does not contain a known database file",
        ))
    }

    /// The bundle directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the data file inside the bundle.
    #[must_use]
    pub fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    /// Path of the blob directory.
    #[must_use]
    pub fn attachments_path(&self) -> PathBuf {
        self.path.join(ATTACHMENTS_DIR)
    }

    /// Path of the transient blob directory used during rekey.
    #[must_use]
    pub fn attachments_temp_path(&self) -> PathBuf {
        self.path.join(ATTACHMENTS_TEMP_DIR)
    }

    /// Deletes the whole bundle directory.
    pub fn delete_recursive(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn acquire_lock(path: &Path) -> Result<File> {
    let lock_path = path.join(LOCK_FILE);
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        return Err(Error::DatabaseLocked);
    }
    Ok(lock_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_resolves_default_engine() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db1");

        let (bundle, engine) = Bundle::find_or_create(&path, true, "").unwrap();
        assert!(path.is_dir());
        assert_eq!(engine.name(), "shale");
        assert_eq!(bundle.data_file_path(), path.join("db.shale"));
    }

    #[test]
    fn missing_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = Bundle::find_or_create(&temp.path().join("absent"), false, "");
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn unknown_engine_is_unimplemented() {
        let temp = tempdir().unwrap();
        let result = Bundle::find_or_create(&temp.path().join("db2"), true, "granite");
        assert!(matches!(result, Err(Error::Unimplemented { .. })));
    }

    #[test]
    fn explicit_engine_with_foreign_file_is_wrong_format() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db3");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("db.other"), b"").unwrap();

        let result = Bundle::find_or_create(&path, false, "shale");
        assert!(matches!(result, Err(Error::WrongFormat { .. })));
    }

    #[test]
    fn empty_existing_bundle_without_engine_is_wrong_format() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db4");
        fs::create_dir_all(&path).unwrap();

        let result = Bundle::find_or_create(&path, false, "");
        assert!(matches!(result, Err(Error::WrongFormat { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db5");

        let (_bundle, _) = Bundle::find_or_create(&path, true, "").unwrap();
        let second = Bundle::find_or_create(&path, true, "");
        assert!(matches!(second, Err(Error::DatabaseLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db6");

        {
            let (_bundle, _) = Bundle::find_or_create(&path, true, "").unwrap();
        }
        // Reopen: the bundle exists but the data file was never created, so
        // only the lock acquisition is being exercised here.
        let result = Bundle::find_or_create(&path, true, "");
        assert!(!matches!(result, Err(Error::DatabaseLocked)));
    }
}
