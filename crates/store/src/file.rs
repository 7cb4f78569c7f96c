//! JSON file-backed store with atomic writes.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{StateStore, StoreError};

/// Whole-file JSON store. Loaded to memory on open; every mutation is
/// written back through a temp-file rename so a crash never leaves a
/// half-written file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Value>>,
}

impl FileStore {
    /// Opens an existing store file or starts empty, creating parent
    /// directories as needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = if path.exists() {
            Self::load(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<HashMap<String, Value>, StoreError> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn persist(&self) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            let entries = self.entries.read();
            serde_json::to_writer_pretty(writer, &*entries)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let entries = self.entries.read();
        let value = entries.get(key).ok_or(StoreError::NotFound)?;
        serde_json::from_value(value.clone()).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.entries.write().insert(key.to_owned(), value);
        self.persist()
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.entries.write().remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.persist()
    }
}
