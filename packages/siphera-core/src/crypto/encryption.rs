//! # Encryption Primitives
//!
//! Symmetric building blocks shared by both crypto backends, the sender-key
//! subsystem, the durable storage tier and key backups.
//!
//! ## Envelope Construction
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ENCRYPTION FLOW                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Shared secret (ECDH or fallback material)                             │
//! │         │                                                               │
//! │         ├──► PBKDF2(salt="encryption", 100k)     → encryption key      │
//! │         └──► PBKDF2(salt="authentication", 100k) → MAC key             │
//! │                                                                         │
//! │  Random 12-byte nonce                                                  │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  Cipher (AES-256-GCM or ChaCha20)  →  ciphertext                       │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  HMAC-SHA256(MAC key, ciphertext || nonce)  →  hmac                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the nonce in bytes (96 bits), for both AES-GCM and ChaCha20
pub const NONCE_SIZE: usize = 12;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// A nonce (number used once)
///
/// **NEVER reuse a nonce with the same key!** Every encryption draws a
/// fresh random nonce, which is safe up to 2^32 messages per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::DeserializationError(format!("Invalid nonce length: {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// A 256-bit symmetric key
///
/// Zeroized when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Secret material for one chat session
///
/// Either the base64 ECDH output or a deterministic fallback string. The raw
/// bytes never leave the crate; only the backends and the session engine
/// read them.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    material: Vec<u8>,
}

impl SharedSecret {
    /// Wrap secret material
    pub fn from_material(material: impl Into<Vec<u8>>) -> Self {
        Self {
            material: material.into(),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.material
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Encrypt with AES-256-GCM
///
/// Returns `(nonce, ciphertext_with_tag)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext, aad)?;
    Ok((nonce, ciphertext))
}

/// Encrypt with AES-256-GCM using a caller-supplied nonce
pub(crate) fn encrypt_with_nonce(
    key: &EncryptionKey,
    nonce: &Nonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .encrypt(
            AesNonce::from_slice(nonce.as_bytes()),
            aes_gcm::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))
}

/// Decrypt with AES-256-GCM
///
/// Fails with `DecryptionFailed` on a wrong key, wrong nonce, wrong AAD or
/// tampered ciphertext.
pub fn decrypt(
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::DecryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(
            AesNonce::from_slice(nonce.as_bytes()),
            aes_gcm::aead::Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            Error::DecryptionFailed("Decryption failed: authentication tag mismatch".into())
        })
}

/// Apply the ChaCha20 keystream in place (encrypts and decrypts)
pub fn chacha20_apply(key: &EncryptionKey, nonce: &Nonce, data: &mut [u8]) -> Result<()> {
    let mut cipher = ChaCha20::new_from_slices(key.as_bytes(), nonce.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid ChaCha20 key or nonce: {}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Compute HMAC-SHA256 over `ciphertext || nonce`
pub fn compute_mac(key: &EncryptionKey, ciphertext: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid MAC key: {}", e)))?;
    mac.update(ciphertext);
    mac.update(nonce.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Check an HMAC-SHA256 tag in constant time
pub fn verify_mac(key: &EncryptionKey, ciphertext: &[u8], nonce: &Nonce, tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(ciphertext);
    mac.update(nonce.as_bytes());
    mac.verify_slice(tag).is_ok()
}

/// AES-256-GCM encrypt and pack as base64(nonce || ciphertext)
pub fn seal_to_base64(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<String> {
    let (nonce, ciphertext) = encrypt(key, plaintext, aad)?;
    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(nonce.as_bytes());
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Inverse of [`seal_to_base64`]
pub fn open_from_base64(key: &EncryptionKey, sealed: &str, aad: &[u8]) -> Result<Vec<u8>> {
    let combined = BASE64
        .decode(sealed)
        .map_err(|e| Error::DecryptionFailed(format!("Invalid base64 payload: {}", e)))?;

    if combined.len() < NONCE_SIZE {
        return Err(Error::DecryptionFailed("Sealed payload too short".into()));
    }

    let nonce = Nonce::from_slice(&combined[..NONCE_SIZE])?;
    decrypt(key, &nonce, &combined[NONCE_SIZE..], aad)
}

// ============================================================================
// TESTS
// ============================================================================
