//! Software crypto backend: ChaCha20 then HMAC-SHA256 (encrypt-then-MAC).
//!
//! Used when the AES-GCM self-test fails. ChaCha20 has no built-in
//! authentication, so the MAC is the only integrity check on this path.
//! Decryption dispatches on the envelope's tag, so native `AES-256-GCM`
//! envelopes still open here.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::{
    chacha20_apply, compute_mac, ecdh, verify_mac, CryptoBackend, EncryptedMessage,
    EncryptionKey, KeyPair, MessageKeys, Nonce, SharedSecret, KDF_ITERATIONS,
};
use crate::error::{Error, Result};
use crate::security::{SecurityAssessment, SecurityLevel};
use crate::time::now_timestamp_millis;

/// Algorithm tag for envelopes produced by this backend
pub const ALGORITHM: &str = "CHACHA20-HMAC-SHA256";

/// Decrypt the ciphertext of a `CHACHA20-HMAC-SHA256` envelope
pub(crate) fn open(key: &EncryptionKey, nonce: &Nonce, mut data: Vec<u8>) -> Result<Vec<u8>> {
    chacha20_apply(key, nonce, &mut data)?;
    Ok(data)
}

/// ChaCha20 + HMAC-SHA256 backend
#[derive(Debug, Clone, Default)]
pub struct SoftwareCryptoBackend;

impl SoftwareCryptoBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CryptoBackend for SoftwareCryptoBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    async fn probe(&self) -> Result<()> {
        let key = EncryptionKey::from_bytes([0x5a; super::KEY_SIZE]);
        let nonce = Nonce::random();

        let mut data = b"probe".to_vec();
        chacha20_apply(&key, &nonce, &mut data)?;
        let tag = compute_mac(&key, &data, &nonce)?;
        if !verify_mac(&key, &data, &nonce, &tag) {
            return Err(Error::NoCryptoBackend("HMAC self-test mismatch".into()));
        }
        chacha20_apply(&key, &nonce, &mut data)?;
        if data != b"probe" {
            return Err(Error::NoCryptoBackend("ChaCha20 self-test mismatch".into()));
        }
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
        let nonce = Nonce::random();

        let mut ciphertext = plaintext.as_bytes().to_vec();
        chacha20_apply(&keys.encryption, &nonce, &mut ciphertext)?;
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
        SecurityAssessment::new(SecurityLevel::Medium)
            .with_risk("Native AES-GCM unavailable, using software stream cipher")
            .with_risk("Message sub-keys use fixed salts")
            .with_recommendation("Run on a platform where the AES-GCM self-test passes")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DecryptionResult, NativeCryptoBackend};

    #[tokio::test]
    async fn test_probe_succeeds() {
        SoftwareCryptoBackend::new().probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_with_ecdh_secret() {
        let backend = SoftwareCryptoBackend::new();
        let a = backend.generate_key_pair().await.unwrap();
        let b = backend.generate_key_pair().await.unwrap();
        let s = backend
            .generate_shared_secret(&a.private_key, &b.public_key)
            .await
            .unwrap();

        let enc = backend.encrypt_message("hello", &s).await.unwrap();
        assert_eq!(enc.algorithm, ALGORITHM);

        let result = backend.decrypt_message(&enc, &s).await;
        assert_eq!(result.message.as_deref(), Some("hello"));
        assert!(result.verified);
        assert!(result.sender_verified);
    }

    #[tokio::test]
    async fn test_bit_flip_in_ciphertext_or_iv() {
        let backend = SoftwareCryptoBackend::new();
        let secret = SharedSecret::from_material("material");
        let enc = backend.encrypt_message("integrity", &secret).await.unwrap();

        let ct_len = BASE64.decode(&enc.encrypted_text).unwrap().len();
        for index in 0..ct_len {
            let mut bytes = BASE64.decode(&enc.encrypted_text).unwrap();
            bytes[index] ^= 0x80;
            let mut tampered = enc.clone();
            tampered.encrypted_text = BASE64.encode(bytes);

            let result = backend.decrypt_message(&tampered, &secret).await;
            assert!(!result.verified);
            assert_eq!(result.message, None);
        }

        let mut iv = BASE64.decode(&enc.iv).unwrap();
        iv[11] ^= 0x01;
        let mut tampered = enc.clone();
        tampered.iv = BASE64.encode(iv);
        assert!(!backend.decrypt_message(&tampered, &secret).await.verified);
    }

    #[tokio::test]
    async fn test_backends_cross_decrypt() {
        let software = SoftwareCryptoBackend::new();
        let native = NativeCryptoBackend::new();
        let a = native.generate_key_pair().await.unwrap();
        let b = software.generate_key_pair().await.unwrap();

        // Each side computes the secret with its own backend
        let s_native = native
            .generate_shared_secret(&a.private_key, &b.public_key)
            .await
            .unwrap();
        let s_software = software
            .generate_shared_secret(&b.private_key, &a.public_key)
            .await
            .unwrap();

        let from_native = native.encrypt_message("from native", &s_native).await.unwrap();
        let result = software.decrypt_message(&from_native, &s_software).await;
        assert_eq!(result.message.as_deref(), Some("from native"));
        assert!(result.verified);

        let from_software = software
            .encrypt_message("from software", &s_software)
            .await
            .unwrap();
        let result = native.decrypt_message(&from_software, &s_native).await;
        assert_eq!(result.message.as_deref(), Some("from software"));
        assert!(result.verified);
    }

    #[tokio::test]
    async fn test_cross_decrypt_still_checks_the_mac() {
        let software = SoftwareCryptoBackend::new();
        let secret = SharedSecret::from_material("material");
        let mut enc = NativeCryptoBackend::new()
            .encrypt_message("tamper", &secret)
            .await
            .unwrap();
        let mut bytes = BASE64.decode(&enc.encrypted_text).unwrap();
        bytes[0] ^= 0x01;
        enc.encrypted_text = BASE64.encode(bytes);

        assert_eq!(
            software.decrypt_message(&enc, &secret).await,
            DecryptionResult::failed()
        );
    }
}
