//! Storage-engine registry.
//!
//! Engines are capabilities keyed by name. The core selects an engine from
//! the configured name (empty name means "the default engine") and consumes
//! only the [`StorageEngine`] interface, so alternative engines can be
//! registered without linking them into the core.

use crate::data_file::{DataFile, OpenOptions};
use crate::error::{StorageError, StorageResult};
use crate::shale::ShaleEngine;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// A storage-engine capability.
pub trait StorageEngine: Send + Sync {
    /// Registry name, e.g. `"shale"`.
    fn name(&self) -> &str;

    /// Human-readable name for logs.
    fn display_name(&self) -> &str;

    /// File extension (without dot) of this engine's data files.
    fn extension(&self) -> &str;

    /// Whether `path` exists and is a file of this engine's format family.
    fn file_exists(&self, path: &Path) -> bool;

    /// Opens a data file, creating it if `options.create` is set.
    fn open_file(&self, path: &Path, options: &OpenOptions) -> StorageResult<Box<dyn DataFile>>;

    /// Upgrades an old-format file in place so a retried open succeeds.
    fn upgrade_file(&self, path: &Path, options: &OpenOptions) -> StorageResult<()>;
}

fn registry() -> &'static RwLock<Vec<Arc<dyn StorageEngine>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<dyn StorageEngine>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(vec![Arc::new(ShaleEngine::new())]))
}

/// Registers an engine. Re-registering a name replaces the entry.
pub fn register_engine(engine: Arc<dyn StorageEngine>) {
    let mut engines = registry().write();
    engines.retain(|e| e.name() != engine.name());
    engines.push(engine);
}

/// Looks up an engine by name. The empty name selects the default engine.
pub fn engine_named(name: &str) -> StorageResult<Arc<dyn StorageEngine>> {
    let engines = registry().read();
    if name.is_empty() {
        return engines
            .first()
            .cloned()
            .ok_or_else(|| StorageError::unimplemented("no storage engines registered"));
    }
    engines
        .iter()
        .find(|e| e.name() == name)
        .cloned()
        .ok_or_else(|| StorageError::unimplemented(format!("no storage engine named '{name}'")))
}

/// All registered engines, default first.
#[must_use]
pub fn registered_engines() -> Vec<Arc<dyn StorageEngine>> {
    registry().read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_is_shale() {
        let engine = engine_named("").unwrap();
        assert_eq!(engine.name(), "shale");
        assert_eq!(engine.extension(), "shale");
    }

    #[test]
    fn lookup_by_name() {
        assert!(engine_named("shale").is_ok());
        assert!(matches!(
            engine_named("bolt"),
            Err(StorageError::Unimplemented { .. })
        ));
    }
}
