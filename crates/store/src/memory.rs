//! In-memory store, mainly for tests.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{StateStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let entries = self.entries.read();
        let value = entries.get(key).ok_or(StoreError::NotFound)?;
        serde_json::from_value(value.clone()).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.entries.write().insert(key.to_owned(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
