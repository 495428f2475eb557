//! Durable tier: a size-bounded key-value table in SQLite.
//!
//! ```text
//! CREATE TABLE kv_store (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at INTEGER NOT NULL
//! )
//! ```
//!
//! Every value is sealed before it is written:
//!
//! ```text
//! master key ──► HKDF-SHA256 ──► AES-256-GCM(value, aad = key name)
//!                                      │
//!                     value column = base64(nonce || ciphertext)
//! ```
//!
//! The key name is bound as associated data, so a value only opens under
//! its own key. Capacity counts the sealed length.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

use super::{StorageBackend, StorageInfo, StorageType};
use crate::crypto::{derive_storage_key, open_from_base64, seal_to_base64, EncryptionKey};
use crate::error::{Error, Result};
use crate::security::SecurityLevel;

/// Default capacity of the durable tier (5 MiB)
pub const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// SQLite-backed storage, encrypted under a master key
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    storage_key: EncryptionKey,
    capacity: usize,
}

impl SqliteStorage {
    /// Open or create a store whose values are sealed under `master_key`
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&Path>, capacity: usize, master_key: &str) -> Result<Self> {
        let storage_key = derive_storage_key(master_key)?;

        let conn = match path {
            Some(p) => Connection::open(p).map_err(|e| {
                Error::StorageUnavailable(format!("Failed to open {}: {}", p.display(), e))
            })?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::StorageUnavailable(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.execute_batch(CREATE_TABLE)
            .map_err(|e| Error::DatabaseError(format!("Failed to create kv_store: {}", e)))?;

        tracing::debug!("Durable storage opened (capacity {} bytes)", capacity);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            storage_key,
            capacity,
        })
    }

    /// Bytes used by every entry except `excluding`
    fn used_bytes(conn: &Connection, excluding: &str) -> Result<usize> {
        let used: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                 FROM kv_store WHERE key != ?",
                params![excluding],
                |row| row.get(0),
            )
            .map_err(|e| Error::StorageReadError(format!("Failed to measure usage: {}", e)))?;

        Ok(usize::try_from(used).unwrap_or(0))
    }

    /// Bytes currently stored
    pub fn used(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Self::used_bytes(&conn, "")
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn store(&self, key: &str, value: &str) -> Result<()> {
        let sealed = seal_to_base64(&self.storage_key, value.as_bytes(), key.as_bytes())?;
        let conn = self.conn.lock();

        let requested = key.len() + sealed.len();
        let used = Self::used_bytes(&conn, key)?;
        if used + requested > self.capacity {
            return Err(Error::StorageCapacityExceeded {
                used,
                requested,
                capacity: self.capacity,
            });
        }

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, sealed, crate::time::now_timestamp_millis()],
        )
        .map_err(|e| Error::StorageWriteError(format!("Failed to store {}: {}", key, e)))?;

        Ok(())
    }

    /// Fetch and open a value
    ///
    /// A value that does not open under this store's key (wrong master key,
    /// tampered row) is reported as `DecryptionFailed`.
    async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        let sealed: String = {
            let conn = self.conn.lock();
            let result = conn.query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get(0),
            );

            match result {
                Ok(sealed) => sealed,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => {
                    return Err(Error::StorageReadError(format!("Failed to read {}: {}", key, e)))
                }
            }
        };

        let plaintext = open_from_base64(&self.storage_key, &sealed, key.as_bytes())
            .map_err(|_| Error::DecryptionFailed(format!("durable value {}", key)))?;
        let value = String::from_utf8(plaintext)
            .map_err(|_| Error::StorageReadError(format!("Value of {} is not UTF-8", key)))?;

        Ok(Some(value))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])
            .map_err(|e| Error::StorageWriteError(format!("Failed to remove {}: {}", key, e)))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store", [])
            .map_err(|e| Error::StorageWriteError(format!("Failed to clear: {}", e)))?;
        Ok(())
    }

    fn get_storage_info(&self) -> StorageInfo {
        StorageInfo {
            storage_type: StorageType::Durable,
            security_level: SecurityLevel::Medium,
            persistence: true,
            capacity: Some(self.capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MASTER: &str = "test-master-key";

    fn raw_value(path: &Path, key: &str) -> String {
        let conn = Connection::open(path).unwrap();
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.db");

        {
            let store = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
            store.store("identity", "snapshot").await.unwrap();
        }

        let reopened = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
        assert_eq!(
            reopened.retrieve("identity").await.unwrap().as_deref(),
            Some("snapshot")
        );
    }

    #[tokio::test]
    async fn test_rows_on_disk_are_sealed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.db");
        let record = r#"{"id":"sender_key_1_abc","userId":"alice","createdAt":1}"#;

        let store = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
        store.store("siphera.sender_key.alice", record).await.unwrap();

        let raw = raw_value(&path, "siphera.sender_key.alice");
        assert_ne!(raw, record);
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_err());
        assert!(!raw.contains("userId"));
        assert!(!raw.contains("alice"));
    }

    #[tokio::test]
    async fn test_wrong_master_key_cannot_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.db");

        {
            let store = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
            store.store("identity", "snapshot").await.unwrap();
        }

        let other = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, "other").unwrap();
        assert!(matches!(
            other.retrieve("identity").await,
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_value_moved_to_another_key_does_not_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.db");

        let store = SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
        store.store("a", "secret").await.unwrap();
        store.store("b", "other").await.unwrap();

        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE kv_store SET value = (SELECT value FROM kv_store WHERE key = 'a') WHERE key = 'b'",
                [],
            )
            .unwrap();
        }

        assert!(matches!(
            store.retrieve("b").await,
            Err(Error::DecryptionFailed(_))
        ));
        assert_eq!(store.retrieve("a").await.unwrap().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_capacity_counts_sealed_length() {
        // base64(12-byte nonce || value || 16-byte tag)
        let sealed_len = |value_len: usize| (12 + value_len + 16).div_ceil(3) * 4;

        let store = SqliteStorage::open(None, 128, MASTER).unwrap();

        store.store("a", "0123456789").await.unwrap();
        assert_eq!(store.used().unwrap(), 1 + sealed_len(10));

        let err = store.store("b", &"x".repeat(40)).await.unwrap_err();
        assert!(matches!(err, Error::StorageCapacityExceeded { capacity: 128, .. }));

        // Replacing an entry only counts the new value
        store.store("a", &"y".repeat(30)).await.unwrap();
        assert_eq!(store.used().unwrap(), 1 + sealed_len(30));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let store = SqliteStorage::open(None, DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
        store.store("a", "1").await.unwrap();
        store.store("b", "2").await.unwrap();

        store.remove("a").await.unwrap();
        assert_eq!(store.retrieve("a").await.unwrap(), None);

        store.clear().await.unwrap();
        assert_eq!(store.retrieve("b").await.unwrap(), None);
        assert_eq!(store.used().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_available_and_info() {
        let store = SqliteStorage::open(None, DEFAULT_CAPACITY_BYTES, MASTER).unwrap();
        assert!(store.is_available().await);

        let info = store.get_storage_info();
        assert!(info.persistence);
        assert_eq!(info.security_level, SecurityLevel::Medium);
        assert_eq!(info.capacity, Some(DEFAULT_CAPACITY_BYTES));
    }

    #[tokio::test]
    async fn test_full_store_is_unavailable() {
        let store = SqliteStorage::open(None, 4, MASTER).unwrap();
        assert!(!store.is_available().await);
    }
}
