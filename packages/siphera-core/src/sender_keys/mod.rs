//! # Sender Keys
//!
//! A sender cannot decrypt their own outgoing envelope: it is keyed for the
//! recipient's session. Every outgoing message therefore also carries a
//! sender reference, a copy of the plaintext sealed under a self-key.
//!
//! ## Regenerable Keys
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SENDER KEY                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  id         sender_key_<createdAt>_<9 random [a-z0-9]>                 │
//! │  userId     owner                                                      │
//! │  createdAt  Unix ms, embedded in the id                                │
//! │                                                                         │
//! │  key = PBKDF2-SHA256("<userId>_<createdAt>",                           │
//! │                      salt = "siphera_sender_salt", 100k)               │
//! │                                                                         │
//! │  Only {id, userId, createdAt} is ever written to storage, and the      │
//! │  durable tier seals it. Given a key id and the local user id, the      │
//! │  key is derived again through CryptoBackend::derive_key.               │
//! │                                                                         │
//! │  Sender reference content = base64(nonce || AES-256-GCM(key, text))    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::{open_from_base64, salts, seal_to_base64, CryptoBackend, EncryptionKey};
use crate::error::{Error, Result};
use crate::storage::{keys, StorageBackend};
use crate::time::now_timestamp_millis;

/// Prefix of every sender key id
pub const SENDER_KEY_ID_PREFIX: &str = "sender_key_";

/// Length of the random id suffix
const ID_SUFFIX_LEN: usize = 9;
const ID_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A self-key; the key bytes never leave this module
pub struct SenderKey {
    /// Key id
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Creation time, Unix ms
    pub created_at: i64,
    key: EncryptionKey,
}

impl std::fmt::Debug for SenderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKey")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl SenderKey {
    async fn derive(
        backend: &dyn CryptoBackend,
        id: String,
        user_id: &str,
        created_at: i64,
    ) -> Result<Self> {
        let password = format!("{}_{}", user_id, created_at);
        let key = backend.derive_key(&password, salts::SENDER_KEY).await?;

        Ok(Self {
            id,
            user_id: user_id.to_string(),
            created_at,
            key,
        })
    }

    fn record(&self) -> SenderKeyRecord {
        SenderKeyRecord {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// The persisted part of a sender key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyRecord {
    /// Key id
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Creation time, Unix ms
    pub created_at: i64,
}

/// Self-encrypted copy of an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderReference {
    /// base64(nonce || ciphertext)
    pub content: String,
    /// Sender key id
    pub key_id: String,
    /// Unix ms
    pub timestamp: i64,
}

/// Extract `createdAt` from a sender key id
pub fn parse_key_id(key_id: &str) -> Result<i64> {
    let invalid = || Error::InvalidSenderKeyId(key_id.to_string());

    let rest = key_id.strip_prefix(SENDER_KEY_ID_PREFIX).ok_or_else(invalid)?;
    let (timestamp, suffix) = rest.split_once('_').ok_or_else(invalid)?;
    if suffix.is_empty() {
        return Err(invalid());
    }

    timestamp.parse::<i64>().map_err(|_| invalid())
}

fn new_key_id(created_at: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_SUFFIX_CHARSET[rng.gen_range(0..ID_SUFFIX_CHARSET.len())]))
        .collect();
    format!("{}{}_{}", SENDER_KEY_ID_PREFIX, created_at, suffix)
}

/// Sender key cache and self-encryption
pub struct SenderKeyService {
    /// Local identity; keys looked up by id are derived for this user
    user_id: String,
    backend: Arc<dyn CryptoBackend>,
    storage: Option<Arc<dyn StorageBackend>>,
    by_user: RwLock<HashMap<String, Arc<SenderKey>>>,
    by_id: RwLock<HashMap<String, Arc<SenderKey>>>,
}

impl SenderKeyService {
    /// Create a service for the local user
    ///
    /// With `storage`, the current key record is persisted and reused after
    /// a restart.
    pub fn new(
        user_id: impl Into<String>,
        backend: Arc<dyn CryptoBackend>,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            backend,
            storage,
            by_user: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// The local user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current sender key for `user_id`, loading or generating it on a miss
    pub async fn get_sender_key(&self, user_id: &str) -> Result<Arc<SenderKey>> {
        let cached = self.by_user.read().get(user_id).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        if let Some(record) = self.load_record(user_id).await {
            let key = SenderKey::derive(
                self.backend.as_ref(),
                record.id,
                &record.user_id,
                record.created_at,
            )
            .await?;
            let key = Arc::new(key);
            self.cache(&key);
            tracing::debug!("Sender key {} restored from record", key.id);
            return Ok(key);
        }

        self.generate_sender_key(user_id).await
    }

    /// Create a fresh sender key for `user_id` and make it current
    pub async fn generate_sender_key(&self, user_id: &str) -> Result<Arc<SenderKey>> {
        let created_at = now_timestamp_millis();
        let key = SenderKey::derive(
            self.backend.as_ref(),
            new_key_id(created_at),
            user_id,
            created_at,
        )
        .await?;
        let key = Arc::new(key);

        self.cache(&key);
        self.save_record(&key.record()).await;

        tracing::info!("Generated sender key {}", key.id);
        Ok(key)
    }

    /// Regenerate a key from its id, assuming it belongs to the local user
    pub async fn get_sender_key_by_id(&self, key_id: &str) -> Result<Arc<SenderKey>> {
        let cached = self.by_id.read().get(key_id).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        let created_at = parse_key_id(key_id)?;
        let key = SenderKey::derive(
            self.backend.as_ref(),
            key_id.to_string(),
            &self.user_id,
            created_at,
        )
        .await?;
        let key = Arc::new(key);
        self.by_id.write().insert(key.id.clone(), key.clone());

        tracing::debug!("Regenerated sender key {}", key_id);
        Ok(key)
    }

    /// Seal `content` under the current sender key of `user_id`
    pub async fn encrypt_for_sender(&self, content: &str, user_id: &str) -> Result<SenderReference> {
        let key = self.get_sender_key(user_id).await?;
        let sealed = seal_to_base64(&key.key, content.as_bytes(), b"")?;

        Ok(SenderReference {
            content: sealed,
            key_id: key.id.clone(),
            timestamp: now_timestamp_millis(),
        })
    }

    /// Open a sender reference
    pub async fn decrypt_for_sender(&self, reference: &SenderReference) -> Result<String> {
        let key = self.get_sender_key_by_id(&reference.key_id).await?;

        let plaintext = open_from_base64(&key.key, &reference.content, b"").map_err(|_| {
            Error::DecryptionFailed(format!("sender reference under {}", reference.key_id))
        })?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::DecryptionFailed("sender reference is not UTF-8".into()))
    }

    /// Drop every cached key; records in storage are kept
    pub fn clear_cache(&self) {
        self.by_user.write().clear();
        self.by_id.write().clear();
    }

    fn cache(&self, key: &Arc<SenderKey>) {
        self.by_user.write().insert(key.user_id.clone(), key.clone());
        self.by_id.write().insert(key.id.clone(), key.clone());
    }

    async fn load_record(&self, user_id: &str) -> Option<SenderKeyRecord> {
        let storage = self.storage.as_ref()?;
        let slot = format!("{}{}", keys::SENDER_KEY_PREFIX, user_id);

        let json = match storage.retrieve(&slot).await {
            Ok(json) => json?,
            Err(e) => {
                tracing::warn!("Sender key record unreadable: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<SenderKeyRecord>(&json) {
            Ok(record) if parse_key_id(&record.id).ok() == Some(record.created_at) => Some(record),
            _ => {
                tracing::warn!("Ignoring malformed sender key record for {}", user_id);
                None
            }
        }
    }

    async fn save_record(&self, record: &SenderKeyRecord) {
        let Some(storage) = &self.storage else {
            return;
        };
        let slot = format!("{}{}", keys::SENDER_KEY_PREFIX, record.user_id);

        let result = match serde_json::to_string(record) {
            Ok(json) => storage.store(&slot, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Sender key record not persisted: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NativeCryptoBackend, SoftwareCryptoBackend};
    use crate::storage::{MemoryStorage, SqliteStorage, DEFAULT_CAPACITY_BYTES};
    use tempfile::TempDir;

    fn service(user_id: &str, storage: Option<Arc<dyn StorageBackend>>) -> SenderKeyService {
        SenderKeyService::new(user_id, Arc::new(NativeCryptoBackend::new()), storage)
    }

    #[test]
    fn test_key_id_format() {
        let id = new_key_id(1_700_000_000_000);
        let suffix = id.rsplit('_').next().unwrap();

        assert!(id.starts_with("sender_key_1700000000000_"));
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(parse_key_id(&id).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for bad in ["", "sender_key_", "sender_key_abc_def", "other_123_abc", "sender_key_123_"] {
            assert!(
                matches!(parse_key_id(bad), Err(Error::InvalidSenderKeyId(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_current_key_is_reused() {
        let service = service("alice", None);

        let first = service.get_sender_key("alice").await.unwrap();
        let second = service.get_sender_key("alice").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_regenerated_key_decrypts_after_cache_loss() {
        let service = service("alice", None);
        let reference = service
            .encrypt_for_sender("note to self", "alice")
            .await
            .unwrap();

        service.clear_cache();
        assert_eq!(
            service.decrypt_for_sender(&reference).await.unwrap(),
            "note to self"
        );

        // A brand new instance for the same user can also read it
        let fresh = self::service("alice", None);
        assert_eq!(
            fresh.decrypt_for_sender(&reference).await.unwrap(),
            "note to self"
        );
    }

    #[tokio::test]
    async fn test_other_user_cannot_decrypt() {
        let alice = service("alice", None);
        let reference = alice.encrypt_for_sender("private", "alice").await.unwrap();

        let mallory = service("mallory", None);
        assert!(matches!(
            mallory.decrypt_for_sender(&reference).await,
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_record_survives_restart() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());

        let before = service("alice", Some(storage.clone()));
        let original = before.get_sender_key("alice").await.unwrap();

        let after = service("alice", Some(storage));
        let restored = after.get_sender_key("alice").await.unwrap();
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.created_at, original.created_at);
    }

    #[tokio::test]
    async fn test_generate_replaces_current_key() {
        let service = service("alice", None);
        let old = service.encrypt_for_sender("old", "alice").await.unwrap();

        let new_key = service.generate_sender_key("alice").await.unwrap();
        assert_ne!(new_key.id, old.key_id);
        assert_eq!(service.get_sender_key("alice").await.unwrap().id, new_key.id);

        // Older references stay readable
        assert_eq!(service.decrypt_for_sender(&old).await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_either_backend_derives_the_same_key() {
        let native = service("alice", None);
        let reference = native.encrypt_for_sender("portable", "alice").await.unwrap();

        let software =
            SenderKeyService::new("alice", Arc::new(SoftwareCryptoBackend::new()), None);
        assert_eq!(
            software.decrypt_for_sender(&reference).await.unwrap(),
            "portable"
        );
    }

    #[tokio::test]
    async fn test_durable_record_is_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("siphera.db");
        let storage: Arc<dyn StorageBackend> = Arc::new(
            SqliteStorage::open(Some(&path), DEFAULT_CAPACITY_BYTES, "test-master").unwrap(),
        );

        let alice = service("alice", Some(storage.clone()));
        let key = alice.get_sender_key("alice").await.unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        let raw: String = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                [format!("{}alice", keys::SENDER_KEY_PREFIX)],
                |row| row.get(0),
            )
            .unwrap();
        assert!(serde_json::from_str::<SenderKeyRecord>(&raw).is_err());
        assert!(!raw.contains(&key.id));

        // Still restorable through the store itself
        let restarted = service("alice", Some(storage));
        assert_eq!(restarted.get_sender_key("alice").await.unwrap().id, key.id);
    }
}
