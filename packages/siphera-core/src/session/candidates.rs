//! Candidate secrets for incoming messages.
//!
//! Messages from older clients were encrypted under secrets derived in
//! slightly different ways. Decryption walks this fixed list in order and
//! stops at the first secret that authenticates.

use crate::crypto::{sha256_hex, SharedSecret};

const SESSION_SUFFIX: &str = "siphera_session";
const TRUNCATED_KEY_LEN: usize = 32;

/// How a candidate secret was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretDerivation {
    /// P-256 agreement with the contact's public key
    Ecdh,
    /// hex(SHA-256(private_key || contact_id))
    Fallback,
    /// hex(SHA-256(contact_id || private_key))
    Reversed,
    /// hex(SHA-256(private_key || ":" || contact_id))
    Separated,
    /// hex(SHA-256(private_key || contact_id || "siphera_session"))
    Suffixed,
    /// hex(SHA-256(private_key[..32] || contact_id))
    Truncated,
    /// private_key || contact_id, unhashed
    Raw,
}

impl SecretDerivation {
    /// Derivations kept only for reading old messages, in trial order
    pub const LEGACY: [SecretDerivation; 5] = [
        Self::Reversed,
        Self::Separated,
        Self::Suffixed,
        Self::Truncated,
        Self::Raw,
    ];

    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecdh => "ecdh",
            Self::Fallback => "fallback",
            Self::Reversed => "reversed",
            Self::Separated => "separated",
            Self::Suffixed => "suffixed",
            Self::Truncated => "truncated",
            Self::Raw => "raw",
        }
    }

    /// Derive from the local private key and a contact id
    ///
    /// `None` for [`SecretDerivation::Ecdh`], which needs the contact's key.
    pub fn derive(&self, private_key: &str, contact_id: &str) -> Option<SharedSecret> {
        let private = private_key.as_bytes();
        let contact = contact_id.as_bytes();

        let material = match self {
            Self::Ecdh => return None,
            Self::Fallback => sha256_hex(&[private, contact]),
            Self::Reversed => sha256_hex(&[contact, private]),
            Self::Separated => sha256_hex(&[private, b":", contact]),
            Self::Suffixed => sha256_hex(&[private, contact, SESSION_SUFFIX.as_bytes()]),
            Self::Truncated => {
                let head = private.get(..TRUNCATED_KEY_LEN).unwrap_or(private);
                sha256_hex(&[head, contact])
            }
            Self::Raw => format!("{}{}", private_key, contact_id),
        };

        Some(SharedSecret::from_material(material))
    }
}

/// The deterministic secret used before a contact's key is known
pub fn fallback_secret(private_key: &str, contact_id: &str) -> SharedSecret {
    SharedSecret::from_material(sha256_hex(&[private_key.as_bytes(), contact_id.as_bytes()]))
}

/// A secret to try, tagged with its derivation
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Derivation
    pub derivation: SecretDerivation,
    /// Secret material
    pub secret: SharedSecret,
}

/// Ordered candidates: ECDH when available, fallback, then legacy variants
pub fn build(ecdh: Option<SharedSecret>, private_key: &str, contact_id: &str) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(2 + SecretDerivation::LEGACY.len());

    if let Some(secret) = ecdh {
        candidates.push(Candidate {
            derivation: SecretDerivation::Ecdh,
            secret,
        });
    }

    candidates.push(Candidate {
        derivation: SecretDerivation::Fallback,
        secret: fallback_secret(private_key, contact_id),
    });

    for derivation in SecretDerivation::LEGACY {
        if let Some(secret) = derivation.derive(private_key, contact_id) {
            candidates.push(Candidate { derivation, secret });
        }
    }

    candidates
}
