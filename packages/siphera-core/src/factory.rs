//! # Backend Factory
//!
//! Picks the crypto and storage backends at startup by actually using them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         AUTO CONFIGURATION                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. Crypto   native.probe() ──ok──► NativeCryptoBackend                │
//! │                   │                                                     │
//! │                  err                                                    │
//! │                   ▼                                                     │
//! │              software.probe() ──ok──► SoftwareCryptoBackend            │
//! │                   │                                                     │
//! │                  err ──► Error::NoCryptoBackend                        │
//! │                                                                         │
//! │  2. Storage  memory tier always; durable tier if storage_path is set   │
//! │              and a real write/read/delete succeeds                     │
//! │                                                                         │
//! │  3. Strategy memory + durable + fixed master key                       │
//! │                                                                         │
//! │  4. CryptoConfig { backend, storage, strategy, 100k, 256, AES-GCM }    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The durable-tier master key is a fixed constant, not derived from any user
//! secret. Anyone holding the SQLite file and this crate can read the keys.

use std::sync::Arc;

use crate::config::{CryptoPreference, EngineConfig};
use crate::crypto::{
    CryptoBackend, NativeCryptoBackend, SoftwareCryptoBackend, KDF_ITERATIONS, KEY_LENGTH_BITS,
};
use crate::error::{Error, Result};
use crate::security::SecurityAssessment;
use crate::storage::{MemoryStorage, SqliteStorage, StorageBackend};
use crate::strategy::KeyManagementStrategy;

/// Master key protecting the durable tier
pub const MASTER_KEY: &str = "siphera-durable-master-key-v1";

/// Cipher family of every symmetric operation
pub const CIPHER: &str = "AES-GCM";

/// Immutable result of backend selection
#[derive(Clone)]
pub struct CryptoConfig {
    /// Selected crypto backend
    pub backend: Arc<dyn CryptoBackend>,
    /// General-purpose storage: the durable tier when usable, else memory
    pub storage: Arc<dyn StorageBackend>,
    /// Key-management strategy over both tiers
    pub strategy: Arc<KeyManagementStrategy>,
    /// PBKDF2 iterations
    pub kdf_iterations: u32,
    /// Symmetric key length
    pub key_length_bits: u32,
    /// Cipher family
    pub cipher: &'static str,
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("backend", &self.backend.name())
            .field("storage", &self.storage.get_storage_info().storage_type)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("key_length_bits", &self.key_length_bits)
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl CryptoConfig {
    /// Assemble a configuration from already-chosen parts
    pub fn from_parts(
        backend: Arc<dyn CryptoBackend>,
        memory: Arc<dyn StorageBackend>,
        durable: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        let storage = durable.clone().unwrap_or_else(|| memory.clone());
        let strategy = Arc::new(KeyManagementStrategy::new(backend.clone(), memory, durable));

        Self {
            backend,
            storage,
            strategy,
            kdf_iterations: KDF_ITERATIONS,
            key_length_bits: KEY_LENGTH_BITS,
            cipher: CIPHER,
        }
    }

    /// Average the backend, storage and strategy scores
    pub async fn get_security_assessment(&self) -> SecurityAssessment {
        let backend = self.backend.security_assessment();

        let info = self.storage.get_storage_info();
        let mut storage = SecurityAssessment::new(info.security_level);
        if info.persistence {
            storage = storage
                .with_risk("Key material is written to disk")
                .with_recommendation("Use memory-only storage on shared machines");
        }

        let strategy = self.strategy.get_security_assessment().await;

        SecurityAssessment::combine(&[&backend, &storage, &strategy])
    }
}

/// Probes the environment and builds a [`CryptoConfig`]
pub struct BackendFactory;

impl BackendFactory {
    /// Select backends for `config`
    pub async fn auto_configure(config: &EngineConfig) -> Result<CryptoConfig> {
        config.validate()?;

        let backend = Self::select_crypto_backend(config.crypto_preference).await?;
        let (memory, durable) = Self::select_storage(config).await;

        let crypto_config = CryptoConfig::from_parts(backend, memory, durable);
        tracing::info!(
            "Backends selected: crypto={}, storage={:?}",
            crypto_config.backend.name(),
            crypto_config.storage.get_storage_info().storage_type
        );

        Ok(crypto_config)
    }

    /// Probe crypto backends in preference order
    pub async fn select_crypto_backend(
        preference: CryptoPreference,
    ) -> Result<Arc<dyn CryptoBackend>> {
        let mut candidates: Vec<Arc<dyn CryptoBackend>> = Vec::with_capacity(2);
        if preference != CryptoPreference::Software {
            candidates.push(Arc::new(NativeCryptoBackend::new()));
        }
        if preference != CryptoPreference::Native {
            candidates.push(Arc::new(SoftwareCryptoBackend::new()));
        }

        let mut failures = Vec::new();
        for backend in candidates {
            match backend.probe().await {
                Ok(()) => return Ok(backend),
                Err(e) => {
                    tracing::warn!("Crypto backend {} unavailable: {}", backend.name(), e);
                    failures.push(format!("{}: {}", backend.name(), e));
                }
            }
        }

        Err(Error::NoCryptoBackend(failures.join("; ")))
    }

    /// Build the memory tier and, when configured and working, the durable tier
    pub async fn select_storage(
        config: &EngineConfig,
    ) -> (Arc<dyn StorageBackend>, Option<Arc<dyn StorageBackend>>) {
        let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());

        let Some(path) = &config.storage_path else {
            return (memory, None);
        };

        let durable = match SqliteStorage::open(
            Some(path.as_path()),
            config.storage_capacity_bytes,
            MASTER_KEY,
        ) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!("Durable storage unavailable, using memory only: {}", e);
                return (memory, None);
            }
        };

        if !durable.is_available().await {
            tracing::warn!("Durable storage failed its probe, using memory only");
            return (memory, None);
        }

        let durable: Arc<dyn StorageBackend> = Arc::new(durable);
        (memory, Some(durable))
    }
}

// ============================================================================
// TESTS
// ============================================================================
