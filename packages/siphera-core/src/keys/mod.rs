//! # Key Management Service
//!
//! Owns the local identity key pair and the table of contacts' public keys.
//!
//! ## State
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      KEY MANAGEMENT SERVICE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  user_key_pair   Option<KeyPair>   loaded or generated once            │
//! │  contact_keys    contact id → ContactKey                               │
//! │  last_backup     Unix ms of the last export                            │
//! │                                                                         │
//! │  Every mutation writes the full StoredKeys snapshot through the        │
//! │  key-management strategy.                                              │
//! │                                                                         │
//! │  initialize_user_keys()                                                │
//! │     │                                                                   │
//! │     ├── cached?            ──► return it                               │
//! │     ├── strategy has keys? ──► load identity + contacts                │
//! │     └── otherwise          ──► generate, persist                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Regenerating the identity discards every contact key: each existing ECDH
//! session secret becomes underivable.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::{CryptoBackend, KeyPair, SharedSecret};
use crate::error::{Error, Result};
use crate::strategy::KeyManagementStrategy;
use crate::time::now_timestamp_millis;

// ============================================================================
// PERSISTED TYPES
// ============================================================================

/// A contact's public key, learned through key exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactKey {
    /// Contact's user id
    pub user_id: String,
    /// Base64 SEC1 public key
    pub public_key: String,
    /// When the key was last (re)exchanged, Unix ms
    pub last_updated: i64,
}

/// The full persisted key snapshot
///
/// ```json
/// {
///   "userKeyPair": { "publicKey": "...", "privateKey": "...", "fingerprint": "..." },
///   "contactKeys": [ { "userId": "...", "publicKey": "...", "lastUpdated": 0 } ],
///   "lastBackup": 0
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeys {
    /// Local identity
    pub user_key_pair: KeyPair,
    /// Known contacts
    #[serde(default)]
    pub contact_keys: Vec<ContactKey>,
    /// Last export, Unix ms (0 if never)
    #[serde(default)]
    pub last_backup: i64,
}

#[derive(Default)]
struct KeyState {
    user_key_pair: Option<KeyPair>,
    contact_keys: HashMap<String, ContactKey>,
    last_backup: i64,
}

impl KeyState {
    fn snapshot(&self) -> Option<StoredKeys> {
        let user_key_pair = self.user_key_pair.clone()?;

        let mut contact_keys: Vec<ContactKey> = self.contact_keys.values().cloned().collect();
        contact_keys.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        Some(StoredKeys {
            user_key_pair,
            contact_keys,
            last_backup: self.last_backup,
        })
    }

    fn load(&mut self, stored: StoredKeys) {
        self.contact_keys = stored
            .contact_keys
            .into_iter()
            .map(|contact| (contact.user_id.clone(), contact))
            .collect();
        self.last_backup = stored.last_backup;
        self.user_key_pair = Some(stored.user_key_pair);
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Identity and contact key management
pub struct KeyManagementService {
    backend: Arc<dyn CryptoBackend>,
    strategy: Arc<KeyManagementStrategy>,
    state: RwLock<KeyState>,
    init_lock: tokio::sync::Mutex<()>,
}

impl KeyManagementService {
    /// Create a service with no identity loaded yet
    pub fn new(backend: Arc<dyn CryptoBackend>, strategy: Arc<KeyManagementStrategy>) -> Self {
        Self {
            backend,
            strategy,
            state: RwLock::new(KeyState::default()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The crypto backend in use
    pub fn backend(&self) -> &Arc<dyn CryptoBackend> {
        &self.backend
    }

    /// The key-management strategy in use
    pub fn strategy(&self) -> &Arc<KeyManagementStrategy> {
        &self.strategy
    }

    /// Load the identity, or generate and persist a new one
    ///
    /// Idempotent: later calls, including concurrent ones, return the same
    /// key pair.
    pub async fn initialize_user_keys(&self) -> Result<KeyPair> {
        if let Some(pair) = self.user_key_pair() {
            return Ok(pair);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(pair) = self.user_key_pair() {
            return Ok(pair);
        }

        match self.strategy.initialize_keys().await {
            Ok(stored) => {
                if !self.backend.is_valid_key_pair(&stored.user_key_pair) {
                    return Err(Error::CorruptIdentity(
                        "stored key pair failed validation".into(),
                    ));
                }
                let pair = stored.user_key_pair.clone();
                let contacts = stored.contact_keys.len();
                self.state.write().load(stored);

                tracing::info!(
                    "Loaded identity {} with {} contact keys",
                    pair.fingerprint,
                    contacts
                );
                Ok(pair)
            }
            Err(Error::NoExistingKeys) => {
                let pair = self.backend.generate_key_pair().await?;
                self.state.write().user_key_pair = Some(pair.clone());
                self.persist().await?;

                tracing::info!("Generated new identity {}", pair.fingerprint);
                Ok(pair)
            }
            Err(e) => Err(e),
        }
    }

    /// The cached identity, if initialized
    pub fn user_key_pair(&self) -> Option<KeyPair> {
        self.state.read().user_key_pair.clone()
    }

    /// Our public key, if initialized
    pub fn public_key(&self) -> Option<String> {
        self.state
            .read()
            .user_key_pair
            .as_ref()
            .map(|pair| pair.public_key.clone())
    }

    pub(crate) fn private_key(&self) -> Option<Zeroizing<String>> {
        self.state
            .read()
            .user_key_pair
            .as_ref()
            .map(|pair| Zeroizing::new(pair.private_key.clone()))
    }

    /// Insert or replace a contact's public key and persist
    pub async fn store_contact_key(&self, user_id: &str, public_key: &str) -> Result<()> {
        if !self.backend.is_valid_public_key(public_key) {
            return Err(Error::InvalidKey(format!(
                "public key for {} is not a P-256 point",
                user_id
            )));
        }

        {
            let mut state = self.state.write();
            state.contact_keys.insert(
                user_id.to_string(),
                ContactKey {
                    user_id: user_id.to_string(),
                    public_key: public_key.to_string(),
                    last_updated: now_timestamp_millis(),
                },
            );
        }

        tracing::debug!("Stored contact key for {}", user_id);
        self.persist().await
    }

    /// Look up a contact's key
    pub fn get_contact_key(&self, user_id: &str) -> Option<ContactKey> {
        self.state.read().contact_keys.get(user_id).cloned()
    }

    /// Whether a contact's key is known
    pub fn has_contact_key(&self, user_id: &str) -> bool {
        self.state.read().contact_keys.contains_key(user_id)
    }

    /// Known contact ids, sorted
    pub fn contact_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().contact_keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a contact's key; returns whether one was stored
    pub async fn remove_contact_key(&self, user_id: &str) -> Result<bool> {
        let removed = self.state.write().contact_keys.remove(user_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// ECDH with a contact
    ///
    /// `None` when either our private key or their public key is missing,
    /// or when the agreement itself fails.
    pub async fn generate_shared_secret(&self, contact_id: &str) -> Option<SharedSecret> {
        match self.contact_shared_secret(contact_id).await {
            Ok(secret) => Some(secret),
            Err(Error::KeyExchangeUnavailable(_)) | Err(Error::NoExistingKeys) => None,
            Err(e) => {
                tracing::warn!("ECDH with {} failed: {}", contact_id, e);
                None
            }
        }
    }

    /// ECDH with a contact, reporting why it is not possible
    ///
    /// `KeyExchangeUnavailable` until the contact's public key has been
    /// exchanged, `NoExistingKeys` without a local identity.
    pub async fn contact_shared_secret(&self, contact_id: &str) -> Result<SharedSecret> {
        let (private_key, public_key) = {
            let state = self.state.read();
            let pair = state.user_key_pair.as_ref().ok_or(Error::NoExistingKeys)?;
            let contact = state
                .contact_keys
                .get(contact_id)
                .ok_or_else(|| Error::KeyExchangeUnavailable(contact_id.to_string()))?;
            (Zeroizing::new(pair.private_key.clone()), contact.public_key.clone())
        };

        self.backend
            .generate_shared_secret(&private_key, &public_key)
            .await
    }

    /// Drop the identity and every contact key, in memory and in storage
    pub async fn clear_all_keys(&self) -> Result<()> {
        *self.state.write() = KeyState::default();
        self.strategy.clear_keys().await?;

        tracing::info!("Cleared all keys");
        Ok(())
    }

    /// Full reset followed by a fresh identity
    pub async fn regenerate_user_keys(&self) -> Result<KeyPair> {
        let _guard = self.init_lock.lock().await;

        self.clear_all_keys().await?;

        let pair = self.backend.generate_key_pair().await?;
        self.state.write().user_key_pair = Some(pair.clone());
        self.persist().await?;

        tracing::info!("Regenerated identity {}", pair.fingerprint);
        Ok(pair)
    }

    /// Password-protected export of the full snapshot
    pub async fn export_keys(&self, password: &str) -> Result<String> {
        self.persist().await?;
        let blob = self.strategy.backup_keys(password).await?;

        if let Ok(Some(stored)) = self.strategy.retrieve_keys().await {
            self.state.write().last_backup = stored.last_backup;
        }

        Ok(blob)
    }

    /// Replace identity and contacts with a backup
    ///
    /// Returns `false` on a wrong password or a corrupt blob; live state is
    /// only replaced after the blob has been fully validated and persisted.
    pub async fn import_keys(&self, blob: &str, password: &str) -> bool {
        let _guard = self.init_lock.lock().await;

        let stored = match self.strategy.open_backup(blob, password).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Key import rejected: {}", e);
                return false;
            }
        };

        if let Err(e) = self.strategy.store_keys(&stored).await {
            tracing::warn!("Failed to persist imported keys: {}", e);
            return false;
        }

        let fingerprint = stored.user_key_pair.fingerprint.clone();
        self.state.write().load(stored);

        tracing::info!("Imported identity {}", fingerprint);
        true
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.state.read().snapshot();
        match snapshot {
            Some(stored) => self.strategy.store_keys(&stored).await,
            None => {
                tracing::debug!("No identity yet; snapshot not persisted");
                Ok(())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
