//! # Key-Management Strategy
//!
//! Policy for where the [`StoredKeys`] snapshot lives.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       TWO-TIER KEY STORAGE                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  store_keys(keys)                                                      │
//! │     │                                                                   │
//! │     ├──► memory tier   JSON                     (must succeed)         │
//! │     └──► durable tier  JSON, sealed by the tier (best effort)          │
//! │                                                                         │
//! │  retrieve_keys()                                                       │
//! │     │                                                                   │
//! │     ├──► memory tier hit ──────────────────────────────► keys          │
//! │     └──► miss ──► durable tier ──► repopulate memory ──► keys          │
//! │                                                                         │
//! │  Security level:                                                       │
//! │     memory only      → maximum                                         │
//! │     memory + durable → high                                            │
//! │     durable only     → medium                                          │
//! │     neither          → low                                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The durable tier seals every value under its own master key. Backups are
//! sealed with a user password instead, so they restore on any install.

use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::{backup, CryptoBackend};
use crate::error::{Error, Result};
use crate::keys::StoredKeys;
use crate::security::{SecurityAssessment, SecurityLevel};
use crate::storage::{keys, StorageBackend};
use crate::time::now_timestamp_millis;

/// Composes a memory tier and an optional durable tier
///
/// The crypto backend seals and opens password backups.
pub struct KeyManagementStrategy {
    backend: Arc<dyn CryptoBackend>,
    memory: Arc<dyn StorageBackend>,
    durable: Option<Arc<dyn StorageBackend>>,
}

impl KeyManagementStrategy {
    /// Create a strategy
    pub fn new(
        backend: Arc<dyn CryptoBackend>,
        memory: Arc<dyn StorageBackend>,
        durable: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        Self {
            backend,
            memory,
            durable,
        }
    }

    /// The memory tier
    pub fn memory(&self) -> &Arc<dyn StorageBackend> {
        &self.memory
    }

    /// The durable tier, if configured
    pub fn durable(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.durable.as_ref()
    }

    /// Load existing keys; never generates
    pub async fn initialize_keys(&self) -> Result<StoredKeys> {
        self.retrieve_keys().await?.ok_or(Error::NoExistingKeys)
    }

    /// Write-through to memory, best-effort to the durable tier
    pub async fn store_keys(&self, stored: &StoredKeys) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_string(stored)?);

        self.memory.store(keys::STORED_KEYS, &json).await?;

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.store(keys::STORED_KEYS, &json).await {
                tracing::warn!("Durable key storage unavailable, keeping keys in memory: {}", e);
            }
        }

        Ok(())
    }

    /// Memory first, then the durable tier
    ///
    /// A durable hit repopulates the memory tier. A durable snapshot that
    /// fails to decrypt is a corrupt identity.
    pub async fn retrieve_keys(&self) -> Result<Option<StoredKeys>> {
        if let Some(json) = self.memory.retrieve(keys::STORED_KEYS).await? {
            let json = Zeroizing::new(json);
            let stored: StoredKeys = serde_json::from_str(&json)
                .map_err(|e| Error::CorruptIdentity(format!("memory snapshot: {}", e)))?;
            return Ok(Some(stored));
        }

        let Some(durable) = &self.durable else {
            return Ok(None);
        };

        let json = match durable.retrieve(keys::STORED_KEYS).await {
            Ok(Some(json)) => Zeroizing::new(json),
            Ok(None) => return Ok(None),
            Err(e @ Error::DecryptionFailed(_)) => {
                return Err(Error::CorruptIdentity(format!("durable snapshot: {}", e)));
            }
            Err(e) => {
                tracing::warn!("Durable key storage unreadable: {}", e);
                return Ok(None);
            }
        };

        let stored: StoredKeys = serde_json::from_str(&json)
            .map_err(|e| Error::CorruptIdentity(format!("durable snapshot: {}", e)))?;

        self.memory.store(keys::STORED_KEYS, &json).await?;
        tracing::debug!("Keys restored from durable storage");

        Ok(Some(stored))
    }

    /// Remove the snapshot from both tiers
    pub async fn clear_keys(&self) -> Result<()> {
        self.memory.remove(keys::STORED_KEYS).await?;

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(keys::STORED_KEYS).await {
                tracing::warn!("Failed to clear durable key storage: {}", e);
            }
        }

        Ok(())
    }

    /// Seal the current snapshot with a password
    ///
    /// Stamps `last_backup` on the live snapshot once the blob is produced.
    pub async fn backup_keys(&self, password: &str) -> Result<String> {
        let mut stored = self.initialize_keys().await?;

        let json = Zeroizing::new(serde_json::to_vec(&stored)?);
        let blob = backup::seal(self.backend.as_ref(), &json, password).await?;

        stored.last_backup = now_timestamp_millis();
        self.store_keys(&stored).await?;

        tracing::info!("Keys backed up ({} contacts)", stored.contact_keys.len());
        Ok(blob)
    }

    /// Open a backup without touching live state
    pub async fn open_backup(&self, blob: &str, password: &str) -> Result<StoredKeys> {
        let json = Zeroizing::new(backup::open(self.backend.as_ref(), blob, password).await?);
        let stored: StoredKeys = serde_json::from_slice(&json)
            .map_err(|e| Error::BackupImportFailed(format!("invalid snapshot: {}", e)))?;

        if !self.backend.is_valid_key_pair(&stored.user_key_pair) {
            return Err(Error::BackupImportFailed("backup holds an invalid key pair".into()));
        }

        Ok(stored)
    }

    /// Replace the stored snapshot with a backup
    ///
    /// Returns `false` on a wrong password or a corrupt blob, leaving the
    /// stored snapshot untouched.
    pub async fn restore_keys(&self, blob: &str, password: &str) -> bool {
        let stored = match self.open_backup(blob, password).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Key restore rejected: {}", e);
                return false;
            }
        };

        match self.store_keys(&stored).await {
            Ok(()) => {
                tracing::info!("Keys restored from backup");
                true
            }
            Err(e) => {
                tracing::warn!("Failed to persist restored keys: {}", e);
                false
            }
        }
    }

    /// Key rotation
    ///
    /// Not implemented: returns the existing keys unchanged. Regenerating the
    /// identity goes through `KeyManagementService::regenerate_user_keys`.
    pub async fn rotate_keys(&self) -> Result<Option<StoredKeys>> {
        tracing::debug!("Key rotation requested; returning existing keys");
        self.retrieve_keys().await
    }

    /// Score the tiers that are actually usable right now
    pub async fn get_security_assessment(&self) -> SecurityAssessment {
        let memory_ok = self.memory.is_available().await;
        let durable_ok = match &self.durable {
            Some(durable) => durable.is_available().await,
            None => false,
        };

        let level = match (memory_ok, durable_ok) {
            (true, false) => SecurityLevel::Maximum,
            (true, true) => SecurityLevel::High,
            (false, true) => SecurityLevel::Medium,
            (false, false) => SecurityLevel::Low,
        };

        let mut assessment = SecurityAssessment::new(level);
        if durable_ok {
            assessment = assessment
                .with_risk("Keys persisted to disk under a fixed master key")
                .with_recommendation("Protect the storage file with OS-level encryption");
        } else {
            assessment = assessment
                .with_risk("Keys are lost when the process exits")
                .with_recommendation("Export a password-protected key backup");
        }
        if !memory_ok {
            assessment = assessment
                .with_risk("Memory tier unavailable")
                .with_recommendation("Check process memory limits");
        }

        assessment
    }
}

// ============================================================================
// TESTS
// ============================================================================
