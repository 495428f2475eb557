//! Engine configuration.
//!
//! Deserializes from JSON; every field is optional and falls back to its
//! default. Omit `storage_path` for memory-only keys.
//!
//! ```json
//! {
//!   "storage_path": "/var/lib/siphera/keys.db",
//!   "storage_capacity_bytes": 5242880,
//!   "crypto_preference": "software",
//!   "legacy_cutoff_ms": 1735689600000,
//!   "verify_on_first_use": false
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::DEFAULT_CAPACITY_BYTES;

/// Messages older than this (2025-01-01T00:00:00Z, Unix ms) predate the
/// current secret-derivation scheme
pub const DEFAULT_LEGACY_CUTOFF_MS: i64 = 1_735_689_600_000;

/// Which crypto backend to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoPreference {
    /// Native if its probe passes, else software
    #[default]
    Auto,
    /// Native only
    Native,
    /// Software only
    Software,
}

/// Configuration for [`crate::SipheraCore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file for the durable tier (None disables it)
    pub storage_path: Option<PathBuf>,
    /// Durable tier capacity in bytes
    pub storage_capacity_bytes: usize,
    /// Crypto backend selection
    pub crypto_preference: CryptoPreference,
    /// Legacy message cutoff, Unix ms
    pub legacy_cutoff_ms: i64,
    /// Mark contacts verified (trust-on-first-use) when their key first arrives
    pub verify_on_first_use: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            storage_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            crypto_preference: CryptoPreference::Auto,
            legacy_cutoff_ms: DEFAULT_LEGACY_CUTOFF_MS,
            verify_on_first_use: true,
        }
    }
}

impl EngineConfig {
    /// Memory-only configuration
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration with a durable SQLite file
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.is_some() && self.storage_capacity_bytes == 0 {
            return Err(Error::InvalidConfig(
                "storage_capacity_bytes must be positive when storage_path is set".into(),
            ));
        }
        if self.legacy_cutoff_ms < 0 {
            return Err(Error::InvalidConfig("legacy_cutoff_ms must not be negative".into()));
        }
        Ok(())
    }
}
