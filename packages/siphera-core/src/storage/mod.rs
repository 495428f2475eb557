//! # Storage Module
//!
//! Raw key-value persistence behind the [`StorageBackend`] trait.
//!
//! ## Storage Tiers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  MemoryStorage (memory tier)                                    │   │
//! │  │  ───────────────────────────                                     │   │
//! │  │  • Process-lifetime map, nothing touches disk                  │   │
//! │  │  • securityLevel = maximum, persistence = false                │   │
//! │  │  • Unlimited capacity                                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SqliteStorage (durable tier)                                   │   │
//! │  │  ────────────────────────────                                    │   │
//! │  │  • Single kv_store table in a SQLite file                      │   │
//! │  │  • Values sealed under a key derived from the master key       │   │
//! │  │  • securityLevel = medium, persistence = true                  │   │
//! │  │  • Bounded capacity (5 MiB by default)                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Value Encryption
//!
//! ```text
//! key string ──► HKDF-SHA256("siphera-storage-encryption-v1") ──► AES-256-GCM
//!                                                                  │
//!                                        base64(nonce || ciphertext)
//! ```
//!
//! Availability is always probed with a real write, read and delete.
//! A durable file can become unwritable while the process runs.

mod durable;
mod memory;

pub use durable::{SqliteStorage, DEFAULT_CAPACITY_BYTES};
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{derive_storage_key, open_from_base64, seal_to_base64};
use crate::error::{Error, Result};
use crate::security::SecurityLevel;

/// Key names used across storage backends
pub mod keys {
    /// The StoredKeys snapshot
    pub const STORED_KEYS: &str = "siphera.keys.stored";

    /// Sender key records, suffixed with the user id
    pub const SENDER_KEY_PREFIX: &str = "siphera.sender_key.";

    /// Written and removed by availability probes
    pub const PROBE: &str = "siphera.storage.probe";
}

/// Kind of storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Process memory
    Memory,
    /// SQLite file
    Durable,
}

/// What a backend guarantees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// Backend kind
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Exposure of stored values
    pub security_level: SecurityLevel,
    /// Survives a restart
    pub persistence: bool,
    /// Byte limit, `None` when unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// Key-value storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a value
    async fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Fetch a value
    async fn retrieve(&self, key: &str) -> Result<Option<String>>;

    /// Delete a value; missing keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Delete everything
    async fn clear(&self) -> Result<()>;

    /// Encrypt `data` under a key string
    async fn encrypt(&self, data: &str, key: &str) -> Result<String> {
        let storage_key = derive_storage_key(key)?;
        seal_to_base64(&storage_key, data.as_bytes(), b"")
    }

    /// Inverse of [`StorageBackend::encrypt`]
    async fn decrypt(&self, data: &str, key: &str) -> Result<String> {
        let storage_key = derive_storage_key(key)?;
        let plaintext = open_from_base64(&storage_key, data, b"")
            .map_err(|e| Error::StorageReadError(e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::StorageReadError("Decrypted value is not UTF-8".into()))
    }

    /// Probe with a real write, read and delete
    async fn is_available(&self) -> bool {
        const PROBE_VALUE: &str = "ok";

        if self.store(keys::PROBE, PROBE_VALUE).await.is_err() {
            return false;
        }
        let read_back = matches!(
            self.retrieve(keys::PROBE).await,
            Ok(Some(ref value)) if value == PROBE_VALUE
        );
        let removed = self.remove(keys::PROBE).await.is_ok();

        read_back && removed
    }

    /// Describe the backend
    fn get_storage_info(&self) -> StorageInfo;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A backend whose every operation fails
    pub struct UnavailableStorage;

    #[async_trait]
    impl StorageBackend for UnavailableStorage {
        async fn store(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::StorageUnavailable("disabled".into()))
        }

        async fn retrieve(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::StorageUnavailable("disabled".into()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::StorageUnavailable("disabled".into()))
        }

        async fn clear(&self) -> Result<()> {
            Err(Error::StorageUnavailable("disabled".into()))
        }

        fn get_storage_info(&self) -> StorageInfo {
            StorageInfo {
                storage_type: StorageType::Durable,
                security_level: SecurityLevel::Low,
                persistence: false,
                capacity: Some(0),
            }
        }
    }
}
