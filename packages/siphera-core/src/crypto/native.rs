//! Native crypto backend: AES-256-GCM with an additional HMAC-SHA256.
//!
//! The GCM tag already authenticates the ciphertext; the outer MAC over
//! `ciphertext || iv` is carried anyway so every envelope has the same shape
//! regardless of which backend produced it. Decryption goes through
//! [`open_envelope`](super::open_envelope), which also reads software
//! envelopes.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::{
    compute_mac, decrypt, ecdh, encrypt, CryptoBackend, EncryptedMessage, EncryptionKey, KeyPair,
    MessageKeys, Nonce, SharedSecret, KDF_ITERATIONS,
};
use crate::error::{Error, Result};
use crate::security::{SecurityAssessment, SecurityLevel};
use crate::time::now_timestamp_millis;

/// Algorithm tag for envelopes produced by this backend
pub const ALGORITHM: &str = "AES-256-GCM";

/// Decrypt the ciphertext of an `AES-256-GCM` envelope
pub(crate) fn open(key: &EncryptionKey, nonce: &Nonce, ciphertext: Vec<u8>) -> Result<Vec<u8>> {
    decrypt(key, nonce, &ciphertext, b"")
}

/// AES-256-GCM backend
#[derive(Debug, Clone, Default)]
pub struct NativeCryptoBackend;

impl NativeCryptoBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CryptoBackend for NativeCryptoBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    async fn probe(&self) -> Result<()> {
        let key = EncryptionKey::from_bytes(
            self.generate_random_bytes(super::KEY_SIZE)
                .try_into()
                .map_err(|_| Error::NoCryptoBackend("random source returned short read".into()))?,
        );
        let (nonce, ciphertext) = encrypt(&key, b"probe", b"")?;
        let plaintext = decrypt(&key, &nonce, &ciphertext, b"")?;
        if plaintext != b"probe" {
            return Err(Error::NoCryptoBackend("AES-GCM self-test mismatch".into()));
        }
        KeyPair::generate()?;
        Ok(())
    }

    async fn generate_key_pair(&self) -> Result<KeyPair> {
        KeyPair::generate()
    }

    async fn generate_shared_secret(
        &self,
        private_key: &str,
        public_key: &str,
    ) -> Result<SharedSecret> {
        ecdh(private_key, public_key)
    }

    async fn encrypt_message(
        &self,
        plaintext: &str,
        secret: &SharedSecret,
    ) -> Result<EncryptedMessage> {
        let keys = MessageKeys::derive(secret, KDF_ITERATIONS)?;

        let (nonce, ciphertext) = encrypt(&keys.encryption, plaintext.as_bytes(), b"")?;
        let mac = compute_mac(&keys.authentication, &ciphertext, &nonce)?;

        Ok(EncryptedMessage {
            encrypted_text: BASE64.encode(&ciphertext),
            iv: BASE64.encode(nonce.as_bytes()),
            timestamp: now_timestamp_millis(),
            hmac: BASE64.encode(mac),
            algorithm: ALGORITHM.to_string(),
            key_id: None,
        })
    }

    fn security_assessment(&self) -> SecurityAssessment {
        SecurityAssessment::new(SecurityLevel::High)
            .with_risk("Message sub-keys use fixed salts")
            .with_recommendation("Ratchet session keys for forward secrecy")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DecryptionResult;

    fn flip_first_byte(b64: &str) -> String {
        let mut bytes = BASE64.decode(b64).unwrap();
        bytes[0] ^= 0x01;
        BASE64.encode(bytes)
    }

    #[tokio::test]
    async fn test_probe_succeeds() {
        NativeCryptoBackend::new().probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_between_two_identities() {
        let backend = NativeCryptoBackend::new();
        let a = backend.generate_key_pair().await.unwrap();
        let b = backend.generate_key_pair().await.unwrap();

        let s = backend
            .generate_shared_secret(&a.private_key, &b.public_key)
            .await
            .unwrap();
        let enc = backend.encrypt_message("hello", &s).await.unwrap();
        let result = backend.decrypt_message(&enc, &s).await;

        assert_eq!(result.message.as_deref(), Some("hello"));
        assert!(result.verified);

        // The other party derives the same secret
        let s_b = backend
            .generate_shared_secret(&b.private_key, &a.public_key)
            .await
            .unwrap();
        assert!(backend.decrypt_message(&enc, &s_b).await.verified);
    }

    #[tokio::test]
    async fn test_round_trip_unicode_and_empty() {
        let backend = NativeCryptoBackend::new();
        let secret = SharedSecret::from_material("material");

        for text in ["", "héllo wörld 🔐", "line\nbreak"] {
            let enc = backend.encrypt_message(text, &secret).await.unwrap();
            let result = backend.decrypt_message(&enc, &secret).await;
            assert_eq!(result.message.as_deref(), Some(text));
            assert!(result.verified);
        }
    }

    #[tokio::test]
    async fn test_tampering_yields_unverified() {
        let backend = NativeCryptoBackend::new();
        let secret = SharedSecret::from_material("material");
        let enc = backend.encrypt_message("attack at dawn", &secret).await.unwrap();

        let mut bad_text = enc.clone();
        bad_text.encrypted_text = flip_first_byte(&enc.encrypted_text);
        let result = backend.decrypt_message(&bad_text, &secret).await;
        assert!(!result.verified);
        assert_eq!(result.message, None);

        let mut bad_iv = enc.clone();
        bad_iv.iv = flip_first_byte(&enc.iv);
        let result = backend.decrypt_message(&bad_iv, &secret).await;
        assert!(!result.verified);
        assert_eq!(result.message, None);
    }

    #[tokio::test]
    async fn test_wrong_secret_yields_unverified() {
        let backend = NativeCryptoBackend::new();
        let enc = backend
            .encrypt_message("secret", &SharedSecret::from_material("one"))
            .await
            .unwrap();

        let result = backend
            .decrypt_message(&enc, &SharedSecret::from_material("two"))
            .await;
        assert_eq!(result, DecryptionResult::failed());
    }

    #[tokio::test]
    async fn test_envelope_without_mac_is_unverified() {
        let backend = NativeCryptoBackend::new();
        let secret = SharedSecret::from_material("material");
        let mut enc = backend.encrypt_message("old format", &secret).await.unwrap();
        enc.hmac.clear();

        let result = backend.decrypt_message(&enc, &secret).await;
        assert_eq!(result.message.as_deref(), Some("old format"));
        assert!(!result.verified);
    }

    #[tokio::test]
    async fn test_relabeled_envelope_fails() {
        let backend = NativeCryptoBackend::new();
        let secret = SharedSecret::from_material("material");
        let mut enc = backend.encrypt_message("hi", &secret).await.unwrap();
        enc.algorithm = crate::crypto::software::ALGORITHM.into();

        // MAC still matches, but ChaCha20 over AES-GCM output is not the text
        let result = backend.decrypt_message(&enc, &secret).await;
        assert_ne!(result.message.as_deref(), Some("hi"));
    }
}
