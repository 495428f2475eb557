//! # Cryptography Module
//!
//! Cryptographic primitives and the two interchangeable crypto backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  trait CryptoBackend                            │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────────────┐      ┌──────────────────────────┐   │   │
//! │  │   │ NativeCryptoBackend  │      │ SoftwareCryptoBackend    │   │   │
//! │  │   │                      │      │                          │   │   │
//! │  │   │ AES-256-GCM          │      │ ChaCha20 stream cipher   │   │   │
//! │  │   │ + HMAC-SHA256        │      │ + HMAC-SHA256            │   │   │
//! │  │   │ preferred            │      │ fallback                 │   │   │
//! │  │   └──────────────────────┘      └──────────────────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SHARED PRIMITIVES                           │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │  keys        P-256 key pairs, ECDH, fingerprints                │   │
//! │  │  kdf         PBKDF2-SHA256 (100k), HKDF-SHA256                  │   │
//! │  │  encryption  AES-256-GCM, ChaCha20, HMAC-SHA256                 │   │
//! │  │  backup      password-sealed key snapshots                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | ECDH P-256 | Key agreement between two identities |
//! | PBKDF2-SHA256 (100k) | Message sub-keys, sender keys, backup keys |
//! | AES-256-GCM | Native backend cipher, sender keys, storage, backups |
//! | ChaCha20 + HMAC-SHA256 | Software backend encrypt-then-MAC |
//! | HKDF-SHA256 | Durable storage key |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: secret keys and session secrets are zeroized on drop
//! 2. **Constant-Time MAC check**: `hmac::Mac::verify_slice`
//! 3. **Secure Random**: `rand::rngs::OsRng` for keys and nonces
//! 4. **No Nonce Reuse**: a fresh random nonce for every encryption
//! 5. **Decryption never throws**: a failed MAC yields `verified = false` so
//!    the session engine can try its next candidate secret
//! 6. **Interchangeable backends**: decryption dispatches on the envelope's
//!    algorithm tag, so either backend opens envelopes from the other

mod encryption;
mod kdf;
mod keys;

pub mod backup;
pub mod native;
pub mod software;

pub use encryption::{
    chacha20_apply, compute_mac, decrypt, encrypt, open_from_base64, seal_to_base64, verify_mac,
    EncryptionKey, Nonce, SharedSecret, KEY_SIZE, NONCE_SIZE,
};
pub use kdf::{derive_storage_key, pbkdf2_sha256, salts, sha256_hex, MessageKeys, KDF_ITERATIONS};
pub use keys::{
    compute_fingerprint, ecdh, is_valid_key_pair, is_valid_public_key, verify_fingerprint,
    KeyPair, FINGERPRINT_LENGTH, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE,
};
pub use native::NativeCryptoBackend;
pub use software::SoftwareCryptoBackend;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::security::SecurityAssessment;

/// Key length used by every symmetric cipher, in bits
pub const KEY_LENGTH_BITS: u32 = 256;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Self-contained ciphertext envelope
///
/// ```json
/// {
///   "encryptedText": "<base64>",
///   "iv": "<base64, 12 bytes>",
///   "timestamp": 1735689600000,
///   "hmac": "<base64, 32 bytes>",
///   "algorithm": "AES-256-GCM",
///   "keyId": "optional"
/// }
/// ```
///
/// Envelopes from the oldest message format carry no `hmac`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    /// Base64 ciphertext
    pub encrypted_text: String,
    /// Base64 nonce
    pub iv: String,
    /// Creation time (Unix ms)
    pub timestamp: i64,
    /// Base64 HMAC-SHA256 over `ciphertext || iv`, empty when absent
    #[serde(default)]
    pub hmac: String,
    /// Algorithm tag of the producing backend
    pub algorithm: String,
    /// Optional key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl EncryptedMessage {
    /// Whether the envelope carries a MAC
    pub fn has_mac(&self) -> bool {
        !self.hmac.is_empty()
    }

    /// Decode the ciphertext and nonce fields
    pub(crate) fn decode_parts(&self) -> Result<(Nonce, Vec<u8>)> {
        let nonce = Nonce::from_slice(&BASE64.decode(&self.iv)?)?;
        let ciphertext = BASE64.decode(&self.encrypted_text)?;
        Ok((nonce, ciphertext))
    }

    /// Decode the MAC field
    pub(crate) fn decode_mac(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.hmac)?)
    }
}

/// Outcome of [`CryptoBackend::decrypt_message`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecryptionResult {
    /// Recovered plaintext, if any
    pub message: Option<String>,
    /// MAC matched and the cipher accepted the ciphertext
    pub verified: bool,
    /// The envelope was authenticated by a MAC bound to the sender's secret
    pub sender_verified: bool,
}

impl DecryptionResult {
    /// Authenticated plaintext
    pub fn verified(message: String) -> Self {
        Self {
            message: Some(message),
            verified: true,
            sender_verified: true,
        }
    }

    /// Plaintext recovered from an envelope with no MAC
    pub fn unverified(message: String) -> Self {
        Self {
            message: Some(message),
            verified: false,
            sender_verified: false,
        }
    }

    /// Nothing recovered
    pub fn failed() -> Self {
        Self::default()
    }

    /// Non-empty plaintext, authenticated or not
    pub fn is_plausible(&self) -> bool {
        self.message.as_deref().is_some_and(|m| !m.is_empty())
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// A crypto backend
///
/// Chosen once at startup by the backend factory and shared behind an `Arc`.
#[async_trait]
pub trait CryptoBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Algorithm tag written into every envelope
    fn algorithm(&self) -> &'static str;

    /// Exercise the primitives once; `Err` means the backend is unusable here
    async fn probe(&self) -> Result<()>;

    /// Generate a P-256 identity key pair
    async fn generate_key_pair(&self) -> Result<KeyPair>;

    /// ECDH between a private and a public key
    async fn generate_shared_secret(&self, private_key: &str, public_key: &str)
        -> Result<SharedSecret>;

    /// Encrypt and authenticate a UTF-8 message
    async fn encrypt_message(&self, plaintext: &str, secret: &SharedSecret)
        -> Result<EncryptedMessage>;

    /// Authenticate and decrypt an envelope from any backend
    ///
    /// Never fails: a MAC mismatch, a cipher failure or an unknown algorithm
    /// tag all yield `verified = false` with no message.
    async fn decrypt_message(
        &self,
        message: &EncryptedMessage,
        secret: &SharedSecret,
    ) -> DecryptionResult {
        open_envelope(message, secret)
    }

    /// PBKDF2-SHA256 (100k iterations)
    async fn derive_key(&self, password: &str, salt: &[u8]) -> Result<EncryptionKey> {
        pbkdf2_sha256(password.as_bytes(), salt, KDF_ITERATIONS)
    }

    /// Random bytes from the OS generator
    fn generate_random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes
    }

    /// Lowercase hex SHA-256
    fn hash(&self, data: &[u8]) -> String {
        sha256_hex(&[data])
    }

    /// Structural key pair check
    fn is_valid_key_pair(&self, key_pair: &KeyPair) -> bool {
        is_valid_key_pair(key_pair)
    }

    /// Structural public key check
    fn is_valid_public_key(&self, public_key: &str) -> bool {
        is_valid_public_key(public_key)
    }

    /// How much this backend can be trusted
    fn security_assessment(&self) -> SecurityAssessment;
}

// ============================================================================
// ENVELOPE DISPATCH
// ============================================================================

type CipherOpen = fn(&EncryptionKey, &Nonce, Vec<u8>) -> Result<Vec<u8>>;

/// Open an envelope with the cipher named by its algorithm tag
///
/// The MAC over `ciphertext || iv` is checked before decrypting. Envelopes
/// without a MAC come back unverified.
pub fn open_envelope(message: &EncryptedMessage, secret: &SharedSecret) -> DecryptionResult {
    let open: CipherOpen = match message.algorithm.as_str() {
        native::ALGORITHM => native::open,
        software::ALGORITHM => software::open,
        other => {
            tracing::debug!("Unknown envelope algorithm {}", other);
            return DecryptionResult::failed();
        }
    };

    let Ok((nonce, ciphertext)) = message.decode_parts() else {
        return DecryptionResult::failed();
    };
    let Ok(keys) = MessageKeys::derive(secret, KDF_ITERATIONS) else {
        return DecryptionResult::failed();
    };

    let authenticated = if message.has_mac() {
        let Ok(tag) = message.decode_mac() else {
            return DecryptionResult::failed();
        };
        if !verify_mac(&keys.authentication, &ciphertext, &nonce, &tag) {
            return DecryptionResult::failed();
        }
        true
    } else {
        false
    };

    let Ok(plaintext) = open(&keys.encryption, &nonce, ciphertext) else {
        return DecryptionResult::failed();
    };
    let Ok(text) = String::from_utf8(plaintext) else {
        return DecryptionResult::failed();
    };

    if authenticated {
        DecryptionResult::verified(text)
    } else {
        DecryptionResult::unverified(text)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let message = EncryptedMessage {
            encrypted_text: "Y3Q=".into(),
            iv: "AAAAAAAAAAAAAAAA".into(),
            timestamp: 1_735_689_600_000,
            hmac: "bWFj".into(),
            algorithm: "AES-256-GCM".into(),
            key_id: None,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["encryptedText"], "Y3Q=");
        assert_eq!(json["timestamp"], 1_735_689_600_000i64);
        assert!(json.get("keyId").is_none());
    }

    #[test]
    fn test_envelope_without_hmac_parses() {
        let json = r#"{"encryptedText":"Y3Q=","iv":"AAAAAAAAAAAAAAAA","timestamp":1,"algorithm":"AES-256-GCM"}"#;
        let message: EncryptedMessage = serde_json::from_str(json).unwrap();

        assert!(!message.has_mac());
        assert_eq!(message.key_id, None);
    }

    #[test]
    fn test_decode_parts_rejects_short_iv() {
        let message = EncryptedMessage {
            encrypted_text: "Y3Q=".into(),
            iv: BASE64.encode([0u8; 4]),
            timestamp: 0,
            hmac: String::new(),
            algorithm: String::new(),
            key_id: None,
        };

        assert!(message.decode_parts().is_err());
    }

    #[tokio::test]
    async fn test_derive_key_is_deterministic() {
        let backend = NativeCryptoBackend::new();

        let a = backend.derive_key("password", b"salt").await.unwrap();
        let b = backend.derive_key("password", b"salt").await.unwrap();
        let other_salt = backend.derive_key("password", b"pepper").await.unwrap();
        let software = SoftwareCryptoBackend::new()
            .derive_key("password", b"salt")
            .await
            .unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), other_salt.as_bytes());
        assert_eq!(a.as_bytes(), software.as_bytes());
        assert_eq!(
            a.as_bytes(),
            pbkdf2_sha256(b"password", b"salt", KDF_ITERATIONS)
                .unwrap()
                .as_bytes()
        );
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let backend = NativeCryptoBackend::new();

        assert_eq!(
            backend.hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(backend.hash(b""), SoftwareCryptoBackend::new().hash(b""));
    }

    #[test]
    fn test_random_bytes_have_requested_length() {
        let backend = SoftwareCryptoBackend::new();

        assert!(backend.generate_random_bytes(0).is_empty());
        assert_eq!(backend.generate_random_bytes(16).len(), 16);
        assert_eq!(backend.generate_random_bytes(KEY_SIZE).len(), KEY_SIZE);
        assert_ne!(
            backend.generate_random_bytes(32),
            backend.generate_random_bytes(32)
        );
    }

    #[tokio::test]
    async fn test_unknown_algorithm_is_not_opened() {
        let secret = SharedSecret::from_material("material");
        let mut message = NativeCryptoBackend::new()
            .encrypt_message("hi", &secret)
            .await
            .unwrap();
        message.algorithm = "ROT13".into();

        assert_eq!(open_envelope(&message, &secret), DecryptionResult::failed());
    }

    #[test]
    fn test_decryption_result_plausibility() {
        assert!(DecryptionResult::verified("hi".into()).is_plausible());
        assert!(DecryptionResult::unverified("hi".into()).is_plausible());
        assert!(!DecryptionResult::unverified(String::new()).is_plausible());
        assert!(!DecryptionResult::failed().is_plausible());
    }
}
