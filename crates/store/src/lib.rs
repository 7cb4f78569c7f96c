//! Keyed state persistence.
//!
//! A [`StateStore`] maps string keys to JSON-serializable values. The
//! hive uses it to carry known peers and previously active connections
//! across restarts. Two implementations: an in-memory map for tests
//! and a JSON file with atomic writes.

mod file;
mod memory;

use auto_impl::auto_impl;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel for an absent key; callers treat it as "start fresh".
    #[error("key not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Typed key-value persistence.
#[auto_impl(&, Box, Arc)]
pub trait StateStore: Send + Sync {
    /// Loads the value under `key`. [`StoreError::NotFound`] when the
    /// key was never written.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError>;

    /// Writes `value` under `key`, replacing any previous value.
    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Flushes and releases the backing resources.
    fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    fn exercise<S: StateStore>(store: &S) {
        let sample = Sample {
            name: "bee".into(),
            count: 3,
        };
        assert!(matches!(
            store.get::<Sample>("missing"),
            Err(StoreError::NotFound)
        ));
        store.put("sample", &sample).unwrap();
        assert_eq!(store.get::<Sample>("sample").unwrap(), sample);

        let replaced = Sample {
            name: "wasp".into(),
            count: 4,
        };
        store.put("sample", &replaced).unwrap();
        assert_eq!(store.get::<Sample>("sample").unwrap(), replaced);

        store.delete("sample").unwrap();
        assert!(matches!(
            store.get::<Sample>("sample"),
            Err(StoreError::NotFound)
        ));
        // absent delete is fine
        store.delete("sample").unwrap();
    }

    #[test]
    fn memory_store_round_trips() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::new(dir.path().join("state.json")).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::new(&path).unwrap();
        store.put("answer", &42u64).unwrap();
        store.close().unwrap();

        let reopened = FileStore::new(&path).unwrap();
        assert_eq!(reopened.get::<u64>("answer").unwrap(), 42);
    }
}
