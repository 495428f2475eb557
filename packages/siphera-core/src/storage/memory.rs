//! Memory tier: a process-lifetime map.
//!
//! Values are wrapped in `Zeroizing` so key snapshots are wiped from the heap
//! when overwritten, removed or dropped.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use zeroize::Zeroizing;

use super::{StorageBackend, StorageInfo, StorageType};
use crate::error::Result;
use crate::security::SecurityLevel;

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Zeroizing<String>>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn store(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).map(|v| v.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn get_storage_info(&self) -> StorageInfo {
        StorageInfo {
            storage_type: StorageType::Memory,
            security_level: SecurityLevel::Maximum,
            persistence: false,
            capacity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_retrieve_remove() {
        let store = MemoryStorage::new();

        store.store("k", "v1").await.unwrap();
        store.store("k", "v2").await.unwrap();
        assert_eq!(store.retrieve("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(store.len(), 1);

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.retrieve("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStorage::new();
        store.store("a", "1").await.unwrap();
        store.store("b", "2").await.unwrap();

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
