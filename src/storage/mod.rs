//! Durable key/value blobs backing the consensus state.
//!
//! The consensus module only ever reads and writes three keys (`currentTerm`,
//! `votedFor` and `log`); the store itself is agnostic of their meaning.

mod error;
mod file;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use self::error::StorageError;
pub use self::file::FileStorage;

pub trait Storage: Send + Sync {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// True once anything has been written.
    fn has_data(&self) -> Result<bool, StorageError>;
}

/// In-memory store. Clones share the same map, so a node rebuilt from a clone
/// observes everything written before it was stopped.
#[derive(Debug, Clone, Default)]
pub struct MapStorage {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MapStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MapStorage {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut map = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn has_data(&self) -> Result<bool, StorageError> {
        let map = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(!map.is_empty())
    }
}
