//! # Identity Key Pairs
//!
//! P-256 ECDH key pairs, their fingerprints and structural validation.
//!
//! ## Key Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  KeyPair (P-256)                                                        │
//! │  ────────────────                                                       │
//! │                                                                         │
//! │  publicKey:   base64( SEC1 uncompressed point )   65 bytes, 0x04 || X || Y
//! │  privateKey:  base64( scalar )                    32 bytes (secret)     │
//! │  fingerprint: SHA-256(publicKey)[..16 hex], uppercase                   │
//! │                                                                         │
//! │  • Generated once per user, immutable afterwards                       │
//! │  • Fingerprint is a pure function of publicKey                         │
//! │  • Private key is zeroized when the struct is dropped                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey as P256PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use super::encryption::SharedSecret;
use crate::error::{Error, Result};

/// Length of a SEC1 uncompressed P-256 point
pub const PUBLIC_KEY_SIZE: usize = 65;

/// Length of a P-256 private scalar
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Number of hex characters kept in a fingerprint
pub const FINGERPRINT_LENGTH: usize = 16;

/// An asymmetric identity key pair
///
/// ## Security
///
/// - `private_key` is zeroized when dropped
/// - `Debug` output never includes the private key
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// Base64 SEC1 uncompressed public point
    #[zeroize(skip)]
    pub public_key: String,
    /// Base64 private scalar
    pub private_key: String,
    /// Short uppercase hex digest of `public_key`
    #[zeroize(skip)]
    pub fingerprint: String,
}

impl KeyPair {
    /// Generate a new random P-256 key pair
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate() -> Result<Self> {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret(&secret)
    }

    /// Rebuild a key pair from its base64 private scalar
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let secret = decode_secret_key(private_key)?;
        Self::from_secret(&secret)
    }

    fn from_secret(secret: &SecretKey) -> Result<Self> {
        let point = secret.public_key().to_encoded_point(false);
        if point.as_bytes().len() != PUBLIC_KEY_SIZE {
            return Err(Error::KeyGenerationFailed(
                "Unexpected public point encoding".into(),
            ));
        }

        let public_key = BASE64.encode(point.as_bytes());
        let private_key = BASE64.encode(secret.to_bytes());
        let fingerprint = compute_fingerprint(&public_key);

        Ok(Self {
            public_key,
            private_key,
            fingerprint,
        })
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Compute the fingerprint of a public key
///
/// SHA-256 over the public key string, first 16 hex characters, uppercase.
pub fn compute_fingerprint(public_key: &str) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode_upper(digest)[..FINGERPRINT_LENGTH].to_string()
}

/// Recompute a fingerprint and compare it with an expected value
///
/// Comparison ignores ASCII case and surrounding whitespace, since users
/// often read fingerprints back from another screen.
pub fn verify_fingerprint(public_key: &str, expected: &str) -> bool {
    compute_fingerprint(public_key).eq_ignore_ascii_case(expected.trim())
}

/// Structural check of a public key: base64 of a 65-byte uncompressed point
pub fn is_valid_public_key(public_key: &str) -> bool {
    match BASE64.decode(public_key) {
        Ok(bytes) => bytes.len() == PUBLIC_KEY_SIZE && bytes[0] == 0x04,
        Err(_) => false,
    }
}

/// Structural check of a key pair
///
/// Byte lengths and fingerprint shape only; does not prove the halves match.
pub fn is_valid_key_pair(key_pair: &KeyPair) -> bool {
    let private_ok = BASE64
        .decode(&key_pair.private_key)
        .map(|bytes| bytes.len() == PRIVATE_KEY_SIZE)
        .unwrap_or(false);

    private_ok
        && is_valid_public_key(&key_pair.public_key)
        && key_pair.fingerprint.len() == FINGERPRINT_LENGTH
}

/// Perform ECDH between our private key and their public key
///
/// Symmetric: `ecdh(A.priv, B.pub) == ecdh(B.priv, A.pub)`. The secret
/// material is the base64 of the 32-byte shared x-coordinate.
pub fn ecdh(private_key: &str, public_key: &str) -> Result<SharedSecret> {
    let secret = decode_secret_key(private_key)?;

    let public_bytes = BASE64
        .decode(public_key)
        .map_err(|e| Error::InvalidKey(format!("Invalid public key encoding: {}", e)))?;
    let public = P256PublicKey::from_sec1_bytes(&public_bytes)
        .map_err(|_| Error::InvalidKey("Public key is not a valid P-256 point".into()))?;

    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let material = BASE64.encode(shared.raw_secret_bytes());

    Ok(SharedSecret::from_material(material))
}

fn decode_secret_key(private_key: &str) -> Result<SecretKey> {
    let bytes = zeroize::Zeroizing::new(
        BASE64
            .decode(private_key)
            .map_err(|e| Error::InvalidKey(format!("Invalid private key encoding: {}", e)))?,
    );

    if bytes.len() != PRIVATE_KEY_SIZE {
        return Err(Error::InvalidKey(format!(
            "Private key must be {} bytes, got {}",
            PRIVATE_KEY_SIZE,
            bytes.len()
        )));
    }

    SecretKey::from_slice(&bytes)
        .map_err(|_| Error::InvalidKey("Private key is not a valid P-256 scalar".into()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keypair_generation() {
        let kp1 = KeyPair::generate().unwrap();
        let kp2 = KeyPair::generate().unwrap();

        assert_ne!(kp1.public_key, kp2.public_key);
        assert!(is_valid_key_pair(&kp1));
        assert!(is_valid_key_pair(&kp2));
    }

    #[test]
    fn test_keypair_from_private_key() {
        let kp = KeyPair::generate().unwrap();
        let rebuilt = KeyPair::from_private_key(&kp.private_key).unwrap();

        assert_eq!(kp, rebuilt);
    }

    #[test]
    fn test_ecdh_symmetry() {
        for _ in 0..8 {
            let alice = KeyPair::generate().unwrap();
            let bob = KeyPair::generate().unwrap();

            let alice_shared = ecdh(&alice.private_key, &bob.public_key).unwrap();
            let bob_shared = ecdh(&bob.private_key, &alice.public_key).unwrap();

            assert_eq!(alice_shared, bob_shared);
        }
    }

    #[test]
    fn test_ecdh_rejects_garbage_public_key() {
        let alice = KeyPair::generate().unwrap();
        let bogus = BASE64.encode([0x04u8; PUBLIC_KEY_SIZE]);

        assert!(ecdh(&alice.private_key, &bogus).is_err());
        assert!(ecdh(&alice.private_key, "not base64!").is_err());
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let kp = KeyPair::generate().unwrap();

        let fp1 = compute_fingerprint(&kp.public_key);
        let fp2 = compute_fingerprint(&kp.public_key);

        assert_eq!(fp1, fp2);
        assert_eq!(fp1, kp.fingerprint);
        assert_eq!(fp1.len(), FINGERPRINT_LENGTH);
        assert_eq!(fp1, fp1.to_uppercase());
    }

    #[test]
    fn test_fingerprints_differ_across_keys() {
        let fingerprints: HashSet<String> = (0..64)
            .map(|_| KeyPair::generate().unwrap().fingerprint.clone())
            .collect();

        assert_eq!(fingerprints.len(), 64);
    }

    #[test]
    fn test_verify_fingerprint() {
        let kp = KeyPair::generate().unwrap();

        assert!(verify_fingerprint(&kp.public_key, &kp.fingerprint));
        assert!(verify_fingerprint(&kp.public_key, &kp.fingerprint.to_lowercase()));
        assert!(!verify_fingerprint(&kp.public_key, "0000000000000000"));
    }

    #[test]
    fn test_public_key_validation() {
        let kp = KeyPair::generate().unwrap();

        assert!(is_valid_public_key(&kp.public_key));
        assert!(!is_valid_public_key(""));
        assert!(!is_valid_public_key(&BASE64.encode([4u8; 33])));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let kp = KeyPair::generate().unwrap();
        let debug = format!("{:?}", kp);

        assert!(!debug.contains(&kp.private_key));
        assert!(debug.contains("<redacted>"));
    }
}
