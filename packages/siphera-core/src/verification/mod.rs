//! # Key Verification
//!
//! Three independent ways to mark a contact's key as trusted.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TRUST MODELS                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  fingerprint         recompute SHA-256(publicKey)[..16] and compare    │
//! │                      with a value read out of band                     │
//! │                                                                         │
//! │  out-of-band         A: create_verification_request(A, B)              │
//! │                      B: create_verification_response(A, B) → "042917"  │
//! │                      code travels over another channel                 │
//! │                      A: verify_with_code(A, B, "042917") → both trusted│
//! │                                                                         │
//! │  trust-on-first-use  first key seen for a contact is trusted           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Status never expires or downgrades on its own; only
//! [`KeyVerificationService::revoke_verification`] clears it.

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::verify_fingerprint;
use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

/// Number of digits in an out-of-band code
pub const CODE_DIGITS: usize = 6;

/// How a contact came to be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    /// Fingerprint compared by the user
    Fingerprint,
    /// Six-digit code exchanged over another channel
    OutOfBand,
    /// First key seen was accepted
    TrustOnFirstUse,
}

impl VerificationMethod {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fingerprint => "fingerprint",
            Self::OutOfBand => "out-of-band",
            Self::TrustOnFirstUse => "trust-on-first-use",
        }
    }
}

/// Trust state of one contact
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStatus {
    /// Trusted
    pub is_verified: bool,
    /// How trust was established
    pub verification_method: Option<VerificationMethod>,
    /// When, Unix ms
    pub last_verified: Option<i64>,
    /// Code used for out-of-band verification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
}

impl VerificationStatus {
    fn verified(method: VerificationMethod, code: Option<String>) -> Self {
        Self {
            is_verified: true,
            verification_method: Some(method),
            last_verified: Some(now_timestamp_millis()),
            verification_code: code,
        }
    }
}

/// A pending out-of-band verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    /// User asking to verify
    pub requester: String,
    /// User being verified
    pub target: String,
    /// Unix ms
    pub created_at: i64,
}

#[derive(Debug, Clone)]
struct PendingVerification {
    request: VerificationRequest,
    code: Option<String>,
}

/// Verification bookkeeping for the local user
#[derive(Default)]
pub struct KeyVerificationService {
    statuses: RwLock<HashMap<String, VerificationStatus>>,
    pending: RwLock<HashMap<(String, String), PendingVerification>>,
}

impl KeyVerificationService {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute a fingerprint and compare
    pub fn verify_key_fingerprint(&self, public_key: &str, expected_fingerprint: &str) -> bool {
        verify_fingerprint(public_key, expected_fingerprint)
    }

    /// Compare a contact's fingerprint and mark them verified on a match
    pub fn verify_contact_fingerprint(
        &self,
        contact_id: &str,
        public_key: &str,
        expected_fingerprint: &str,
    ) -> bool {
        if !verify_fingerprint(public_key, expected_fingerprint) {
            tracing::warn!("Fingerprint mismatch for {}", contact_id);
            return false;
        }

        self.statuses.write().insert(
            contact_id.to_string(),
            VerificationStatus::verified(VerificationMethod::Fingerprint, None),
        );
        tracing::info!("Verified {} by fingerprint", contact_id);
        true
    }

    /// Start an out-of-band verification of `target` by `requester`
    pub fn create_verification_request(&self, requester: &str, target: &str) -> VerificationRequest {
        let request = VerificationRequest {
            requester: requester.to_string(),
            target: target.to_string(),
            created_at: now_timestamp_millis(),
        };

        self.pending.write().insert(
            (requester.to_string(), target.to_string()),
            PendingVerification {
                request: request.clone(),
                code: None,
            },
        );

        request
    }

    /// Answer a pending request with a fresh six-digit code
    pub fn create_verification_response(&self, requester: &str, target: &str) -> Result<String> {
        let mut pending = self.pending.write();
        let entry = pending
            .get_mut(&(requester.to_string(), target.to_string()))
            .ok_or_else(|| {
                Error::VerificationRequestNotFound(requester.to_string(), target.to_string())
            })?;

        let code = generate_code();
        entry.code = Some(code.clone());
        Ok(code)
    }

    /// Pending request between two users, in either direction
    pub fn pending_request(&self, user_a: &str, user_b: &str) -> Option<VerificationRequest> {
        let pending = self.pending.read();
        pending
            .get(&(user_a.to_string(), user_b.to_string()))
            .or_else(|| pending.get(&(user_b.to_string(), user_a.to_string())))
            .map(|p| p.request.clone())
    }

    /// Check a code against the stored response in either direction
    ///
    /// On success both users are marked verified and the request is closed.
    pub fn verify_with_code(&self, user_a: &str, user_b: &str, code: &str) -> bool {
        let forward = (user_a.to_string(), user_b.to_string());
        let backward = (user_b.to_string(), user_a.to_string());

        let matched = {
            let mut pending = self.pending.write();
            let slot = [forward, backward].into_iter().find(|slot| {
                pending
                    .get(slot)
                    .and_then(|p| p.code.as_deref())
                    .is_some_and(|stored| stored == code.trim())
            });
            slot.and_then(|slot| pending.remove(&slot))
        };

        let Some(verified) = matched else {
            tracing::warn!("Verification code rejected for {} / {}", user_a, user_b);
            return false;
        };

        let code = verified.code;
        let mut statuses = self.statuses.write();
        for user in [user_a, user_b] {
            statuses.insert(
                user.to_string(),
                VerificationStatus::verified(VerificationMethod::OutOfBand, code.clone()),
            );
        }

        tracing::info!("Verified {} and {} out of band", user_a, user_b);
        true
    }

    /// Trust a contact's first key
    ///
    /// Returns `false` when the contact already has a status.
    pub fn trust_on_first_use(&self, contact_id: &str) -> bool {
        let mut statuses = self.statuses.write();
        if statuses.contains_key(contact_id) {
            return false;
        }

        statuses.insert(
            contact_id.to_string(),
            VerificationStatus::verified(VerificationMethod::TrustOnFirstUse, None),
        );
        tracing::debug!("Trusted {} on first use", contact_id);
        true
    }

    /// Status of a contact; unverified if unknown
    pub fn get_verification_status(&self, contact_id: &str) -> VerificationStatus {
        self.statuses
            .read()
            .get(contact_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a contact is verified
    pub fn is_verified(&self, contact_id: &str) -> bool {
        self.statuses
            .read()
            .get(contact_id)
            .is_some_and(|status| status.is_verified)
    }

    /// Clear a contact's status; returns whether one existed
    pub fn revoke_verification(&self, contact_id: &str) -> bool {
        let removed = self.statuses.write().remove(contact_id).is_some();
        if removed {
            tracing::info!("Revoked verification of {}", contact_id);
        }
        removed
    }
}

fn generate_code() -> String {
    let value: u32 = rand::rngs::OsRng.gen_range(0..1_000_000);
    format!("{:0width$}", value, width = CODE_DIGITS)
}
