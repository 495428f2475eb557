//! # Key Derivation Functions
//!
//! ## Derivation Map
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    KEY DERIVATION HIERARCHY                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Session secret ──► PBKDF2-SHA256(salt="encryption",     100k) ──► Kenc │
//! │                 └─► PBKDF2-SHA256(salt="authentication", 100k) ──► Kmac │
//! │                                                                         │
//! │  "<userId>_<createdAt>" ──► PBKDF2-SHA256(salt="siphera_sender_salt")   │
//! │                                          ──► sender key                 │
//! │                                                                         │
//! │  password ──► PBKDF2-SHA256(salt=random 16 bytes) ──► backup key        │
//! │                                                                         │
//! │  master key ──► HKDF-SHA256(info="siphera-storage-encryption-v1")       │
//! │                                          ──► durable tier key           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The message and sender-key salts are fixed labels, not per-message random
//! salts. Both sides of a conversation must derive identical sub-keys from
//! the session secret alone, and sender keys must be regenerable from their
//! `(userId, createdAt)` record.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use super::encryption::{EncryptionKey, SharedSecret, KEY_SIZE};
use crate::error::{Error, Result};

/// PBKDF2 iteration count for every slow derivation
pub const KDF_ITERATIONS: u32 = 100_000;

/// Fixed salt labels
pub mod salts {
    /// Message encryption sub-key
    pub const ENCRYPTION: &[u8] = b"encryption";

    /// Message authentication sub-key
    pub const AUTHENTICATION: &[u8] = b"authentication";

    /// Sender self-keys
    pub const SENDER_KEY: &[u8] = b"siphera_sender_salt";
}

/// Domain separation strings for HKDF
pub mod domain {
    /// Durable storage tier encryption
    pub const STORAGE_ENCRYPTION: &[u8] = b"siphera-storage-encryption-v1";
}

/// PBKDF2-HMAC-SHA256 into a 256-bit key
pub fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<EncryptionKey> {
    if iterations == 0 {
        return Err(Error::KeyDerivationFailed(
            "PBKDF2 requires at least one iteration".into(),
        ));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    Ok(EncryptionKey::from_bytes(key))
}

/// The pair of sub-keys protecting one message envelope
pub struct MessageKeys {
    /// Cipher key
    pub encryption: EncryptionKey,
    /// MAC key
    pub authentication: EncryptionKey,
}

impl MessageKeys {
    /// Derive both sub-keys from a session secret
    pub fn derive(secret: &SharedSecret, iterations: u32) -> Result<Self> {
        Ok(Self {
            encryption: pbkdf2_sha256(secret.as_bytes(), salts::ENCRYPTION, iterations)?,
            authentication: pbkdf2_sha256(secret.as_bytes(), salts::AUTHENTICATION, iterations)?,
        })
    }
}

/// Derive the durable-tier encryption key from a key string
pub fn derive_storage_key(key: &str) -> Result<EncryptionKey> {
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());

    let mut storage_key = [0u8; KEY_SIZE];
    hkdf.expand(domain::STORAGE_ENCRYPTION, &mut storage_key)
        .map_err(|_| Error::KeyDerivationFailed("Failed to derive storage key".into()))?;

    Ok(EncryptionKey::from_bytes(storage_key))
}

/// Lowercase hex SHA-256 over the concatenation of `parts`
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
