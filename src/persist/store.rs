//! State Store
//!
//! Records keyed by qualified class name (`name` or `ns:name`). The
//! trait keeps the storage engine out of the core; the in-memory
//! implementation backs tests and the JSON-file implementation provides
//! simple durability. External locking of the store is the
//! implementation's concern.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What to do when a persistent class is saved again while still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatePolicy {
    /// Keep the existing expiry if tags are unchanged.
    Preserve,
    /// Restart the clock on every save.
    Reset,
}

impl Default for StatePolicy {
    fn default() -> Self {
        StatePolicy::Reset
    }
}

/// One persistent class record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistEntry {
    /// Absolute expiry, unix seconds.
    pub expires: i64,
    pub policy: StatePolicy,
    /// Comma-separated tag string; tolerated absent on read.
    #[serde(default)]
    pub tags: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state store format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Storage interface for persistent class records.
pub trait StateStore {
    fn read(&self, key: &str) -> Result<Option<PersistEntry>, StoreError>;
    fn write(&mut self, key: &str, entry: PersistEntry) -> Result<(), StoreError>;
    fn delete(&mut self, key: &str) -> Result<(), StoreError>;
    /// All records, in storage order.
    fn scan(&self) -> Result<Vec<(String, PersistEntry)>, StoreError>;
}

/// In-memory store; the default backing and the one tests use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: IndexMap<String, PersistEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<PersistEntry>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, entry: PersistEntry) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.shift_remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, PersistEntry)>, StoreError> {
        Ok(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// JSON-file store: the whole record map is read and rewritten per
/// operation. A missing file reads as an empty store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn load(&self) -> Result<IndexMap<String, PersistEntry>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(IndexMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, entries: &IndexMap<String, PersistEntry>) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<PersistEntry>, StoreError> {
        Ok(self.load()?.get(key).cloned())
    }

    fn write(&mut self, key: &str, entry: PersistEntry) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), entry);
        self.save(&entries)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        if entries.shift_remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, PersistEntry)>, StoreError> {
        Ok(self.load()?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let entry = PersistEntry { expires: 100, policy: StatePolicy::Preserve, tags: "a=1".into() };
        store.write("mykept", entry.clone()).unwrap();
        assert_eq!(store.read("mykept").unwrap(), Some(entry));
        assert_eq!(store.read("absent").unwrap(), None);
    }

    #[test]
    fn test_memory_store_delete_and_scan() {
        let mut store = MemoryStore::new();
        store
            .write("a", PersistEntry { expires: 1, policy: StatePolicy::Reset, tags: String::new() })
            .unwrap();
        store
            .write("b", PersistEntry { expires: 2, policy: StatePolicy::Reset, tags: String::new() })
            .unwrap();
        store.delete("a").unwrap();
        let all = store.scan().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "b");
    }

    #[test]
    fn test_record_tolerates_missing_tags() {
        let entry: PersistEntry =
            serde_json::from_str(r#"{"expires": 42, "policy": "Preserve"}"#).unwrap();
        assert_eq!(entry.tags, "");
        assert_eq!(entry.policy, StatePolicy::Preserve);
    }

    #[test]
    fn test_namespace_qualified_keys() {
        let mut store = MemoryStore::new();
        store
            .write(
                "ops:mykept",
                PersistEntry { expires: 9, policy: StatePolicy::Reset, tags: String::new() },
            )
            .unwrap();
        assert!(store.read("ops:mykept").unwrap().is_some());
        assert!(store.read("mykept").unwrap().is_none());
    }
}
