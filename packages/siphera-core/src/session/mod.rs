//! # Secure Chat Sessions
//!
//! One session per contact, holding the secret used for outgoing messages.
//!
//! ## Session Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SESSION STATES                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   (none) ── get_or_create_session ──┬── contact key known ──┐          │
//! │                                     │                        ▼          │
//! │                                     │                  ┌───────────┐    │
//! │                                     │                  │Established│    │
//! │                                     ▼                  │ ECDH      │    │
//! │                              ┌─────────────┐  key      └───────────┘    │
//! │                              │ Provisional │ ─arrives─►      ▲          │
//! │                              │ fallback    │                 │          │
//! │                              └─────────────┘                 │          │
//! │                                     ▲                        │          │
//! │                                     └── receive adopts the secret       │
//! │                                         that decrypted the message     │
//! │                                                                         │
//! │   Provisional sessions send a key:request to the contact.              │
//! │   A failed ECDH upgrade keeps the provisional secret.                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Receiving
//!
//! ```text
//! timestamp < legacy cutoff ──► LegacyMessageIncompatible (nothing tried)
//!
//! for secret in [ecdh?, fallback, reversed, separated, suffixed, truncated, raw]:
//!     has MAC?  accept when verified
//!     no MAC?   accept when the plaintext is non-empty
//!     accepted: adopt secret into the session, return plaintext
//!
//! DecryptionFailed("no working secret found")
//! ```
//!
//! Concurrent sends and receives on one contact race on the session secret;
//! the last write wins.

pub mod candidates;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{EngineConfig, DEFAULT_LEGACY_CUTOFF_MS};
use crate::crypto::{sha256_hex, EncryptedMessage, SharedSecret};
use crate::error::{Error, Result};
use crate::keys::KeyManagementService;
use crate::sender_keys::{SenderKeyService, SenderReference};
use crate::transport::{KeyExchangeMessage, KeyExchangeTransport};
use crate::verification::KeyVerificationService;

use candidates::{Candidate, SecretDerivation};

// ============================================================================
// TYPES
// ============================================================================

/// Where a session's secret came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Deterministic secret, contact key not yet exchanged
    Provisional,
    /// ECDH secret
    Established,
}

impl SessionState {
    fn for_derivation(derivation: SecretDerivation) -> Self {
        match derivation {
            SecretDerivation::Ecdh => Self::Established,
            _ => Self::Provisional,
        }
    }
}

struct ChatSession {
    contact_id: String,
    shared_secret: SharedSecret,
    derivation: SecretDerivation,
    last_message_time: Option<i64>,
    message_count: u64,
}

impl ChatSession {
    fn new(contact_id: &str, candidate: Candidate) -> Self {
        Self {
            contact_id: contact_id.to_string(),
            shared_secret: candidate.secret,
            derivation: candidate.derivation,
            last_message_time: None,
            message_count: 0,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            contact_id: self.contact_id.clone(),
            state: SessionState::for_derivation(self.derivation),
            last_message_time: self.last_message_time,
            message_count: self.message_count,
        }
    }

    fn record_message(&mut self, timestamp: i64) {
        self.message_count += 1;
        self.last_message_time = Some(timestamp);
    }
}

/// Secret-free view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Contact
    pub contact_id: String,
    /// Provisional or established
    pub state: SessionState,
    /// Last send or receive, Unix ms
    pub last_message_time: Option<i64>,
    /// Messages sent and received
    pub message_count: u64,
}

/// A message as handed to the transport
///
/// ```json
/// {
///   "id": "2b1f...",
///   "sender": "alice",
///   "recipient": "bob",
///   "encryptedData": { "encryptedText": "...", "iv": "...", ... },
///   "messageHash": "9f86d0...",
///   "timestamp": 1767225600000,
///   "isEncrypted": true,
///   "senderReference": { "content": "...", "keyId": "sender_key_...", "timestamp": ... }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureMessage {
    /// Message id (UUID v4)
    pub id: String,
    /// Sender user id
    pub sender: String,
    /// Recipient user id
    pub recipient: String,
    /// Envelope
    pub encrypted_data: EncryptedMessage,
    /// hex(SHA-256(encryptedText || iv))
    pub message_hash: String,
    /// Unix ms
    pub timestamp: i64,
    /// Always true for messages produced here
    pub is_encrypted: bool,
    /// Self-encrypted copy for the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_reference: Option<SenderReference>,
}

fn message_hash(envelope: &EncryptedMessage) -> String {
    sha256_hex(&[envelope.encrypted_text.as_bytes(), envelope.iv.as_bytes()])
}

/// A history entry after decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The stored message, untouched
    pub message: SecureMessage,
    /// Plaintext, `None` when no candidate secret worked
    pub plaintext: Option<String>,
}

/// Session behavior knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Reject messages older than this, Unix ms
    pub legacy_cutoff_ms: i64,
    /// Trust a contact's first key automatically
    pub verify_on_first_use: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            legacy_cutoff_ms: DEFAULT_LEGACY_CUTOFF_MS,
            verify_on_first_use: true,
        }
    }
}

impl From<&EngineConfig> for SessionOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            legacy_cutoff_ms: config.legacy_cutoff_ms,
            verify_on_first_use: config.verify_on_first_use,
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Per-contact sessions and message history for the local user
pub struct SecureChatService {
    user_id: String,
    keys: Arc<KeyManagementService>,
    sender_keys: Arc<SenderKeyService>,
    verification: Arc<KeyVerificationService>,
    transport: Arc<dyn KeyExchangeTransport>,
    options: SessionOptions,
    sessions: RwLock<HashMap<String, ChatSession>>,
    history: RwLock<HashMap<String, Vec<SecureMessage>>>,
}

impl SecureChatService {
    /// Create the service
    pub fn new(
        user_id: impl Into<String>,
        keys: Arc<KeyManagementService>,
        sender_keys: Arc<SenderKeyService>,
        verification: Arc<KeyVerificationService>,
        transport: Arc<dyn KeyExchangeTransport>,
        options: SessionOptions,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            keys,
            sender_keys,
            verification,
            transport,
            options,
            sessions: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Local user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Options in effect
    pub fn options(&self) -> SessionOptions {
        self.options
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Return the session with `contact_id`, creating it if needed
    ///
    /// Without the contact's key the session is provisional and a
    /// `key:request` is sent. A transport failure leaves it provisional.
    pub async fn get_or_create_session(&self, contact_id: &str) -> Result<SessionInfo> {
        let existing = self.sessions.read().get(contact_id).map(ChatSession::info);
        if let Some(info) = existing {
            return Ok(info);
        }

        let identity = self.keys.initialize_user_keys().await?;
        let private_key = self.keys.private_key().ok_or(Error::NoExistingKeys)?;

        let candidate = match self.keys.contact_shared_secret(contact_id).await {
            Ok(secret) => Candidate {
                derivation: SecretDerivation::Ecdh,
                secret,
            },
            Err(e) => {
                if e.is_recoverable() {
                    tracing::info!("{}, requesting a key", e);
                } else {
                    tracing::warn!("ECDH with {} failed, requesting a fresh key: {}", contact_id, e);
                }
                let request = KeyExchangeMessage::Request {
                    requester: self.user_id.clone(),
                    requester_public_key: identity.public_key.clone(),
                };
                if let Err(e) = self.transport.send_key_exchange(contact_id, request).await {
                    tracing::warn!("Key request to {} not sent: {}", contact_id, e);
                }

                Candidate {
                    derivation: SecretDerivation::Fallback,
                    secret: candidates::fallback_secret(&private_key, contact_id),
                }
            }
        };

        let info = self
            .sessions
            .write()
            .entry(contact_id.to_string())
            .or_insert_with(|| ChatSession::new(contact_id, candidate))
            .info();

        tracing::info!("Session with {} is {:?}", contact_id, info.state);
        Ok(info)
    }

    /// Snapshot of a session
    pub fn session_info(&self, contact_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(contact_id).map(ChatSession::info)
    }

    /// Contacts with an open session, sorted
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a session; history is kept
    pub fn end_session(&self, contact_id: &str) -> bool {
        let ended = self.sessions.write().remove(contact_id).is_some();
        if ended {
            tracing::info!("Ended session with {}", contact_id);
        }
        ended
    }

    /// Drop every session and all history
    pub fn clear_sessions(&self) {
        self.sessions.write().clear();
        self.history.write().clear();
        tracing::info!("Cleared all sessions");
    }

    #[cfg(test)]
    pub(crate) fn session_secret(&self, contact_id: &str) -> Option<SharedSecret> {
        self.sessions
            .read()
            .get(contact_id)
            .map(|session| session.shared_secret.clone())
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Encrypt `text` for `recipient_id` and record it in history
    pub async fn send_encrypted_message(&self, recipient_id: &str, text: &str) -> Result<SecureMessage> {
        self.get_or_create_session(recipient_id).await?;

        let secret = self
            .sessions
            .read()
            .get(recipient_id)
            .map(|session| session.shared_secret.clone())
            .ok_or_else(|| Error::SessionNotFound(recipient_id.to_string()))?;

        let encrypted_data = self.keys.backend().encrypt_message(text, &secret).await?;
        let sender_reference = self
            .sender_keys
            .encrypt_for_sender(text, &self.user_id)
            .await?;

        let message = SecureMessage {
            id: Uuid::new_v4().to_string(),
            sender: self.user_id.clone(),
            recipient: recipient_id.to_string(),
            message_hash: message_hash(&encrypted_data),
            timestamp: encrypted_data.timestamp,
            is_encrypted: true,
            encrypted_data,
            sender_reference: Some(sender_reference),
        };

        if let Some(session) = self.sessions.write().get_mut(recipient_id) {
            session.record_message(message.timestamp);
        }
        self.append_history(recipient_id, message.clone());

        tracing::debug!("Sent message {} to {}", message.id, recipient_id);
        Ok(message)
    }

    /// Decrypt a message from `sender_id` and record it in history
    ///
    /// The secret that worked becomes the session's secret.
    pub async fn receive_encrypted_message(
        &self,
        sender_id: &str,
        message: &EncryptedMessage,
    ) -> Result<String> {
        let plaintext = self.decrypt_message(sender_id, message).await?;

        self.append_history(
            sender_id,
            SecureMessage {
                id: Uuid::new_v4().to_string(),
                sender: sender_id.to_string(),
                recipient: self.user_id.clone(),
                message_hash: message_hash(message),
                timestamp: message.timestamp,
                is_encrypted: true,
                encrypted_data: message.clone(),
                sender_reference: None,
            },
        );

        Ok(plaintext)
    }

    /// Decrypt a message from `sender_id` without recording it
    ///
    /// Used for messages that are already persisted elsewhere. The working
    /// secret is still adopted.
    pub async fn decrypt_message(&self, sender_id: &str, message: &EncryptedMessage) -> Result<String> {
        if message.timestamp < self.options.legacy_cutoff_ms {
            tracing::warn!(
                "Rejecting pre-cutoff message from {} ({})",
                sender_id,
                message.timestamp
            );
            return Err(Error::LegacyMessageIncompatible {
                timestamp: message.timestamp,
                cutoff: self.options.legacy_cutoff_ms,
            });
        }

        let (plaintext, candidate) = self.decrypt_with_candidates(sender_id, message).await?;
        self.adopt(sender_id, candidate, message.timestamp);

        Ok(plaintext)
    }

    /// Raw history with a contact, oldest first
    pub fn chat_history(&self, contact_id: &str) -> Vec<SecureMessage> {
        self.history
            .read()
            .get(contact_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Decrypt the stored history with a contact
    ///
    /// Sessions and stored ciphertexts are left unchanged. Entries no
    /// candidate can open come back with `plaintext: None`.
    pub async fn get_decrypted_chat_history(&self, contact_id: &str) -> Result<Vec<HistoryEntry>> {
        let messages = self.chat_history(contact_id);
        let mut entries = Vec::with_capacity(messages.len());

        for message in messages {
            let plaintext = match self
                .decrypt_with_candidates(contact_id, &message.encrypted_data)
                .await
            {
                Ok((plaintext, _)) => Some(plaintext),
                Err(Error::DecryptionFailed(_)) => {
                    tracing::warn!("History message {} is unreadable", message.id);
                    None
                }
                Err(e) => return Err(e),
            };
            entries.push(HistoryEntry { message, plaintext });
        }

        Ok(entries)
    }

    // ------------------------------------------------------------------------
    // Key exchange
    // ------------------------------------------------------------------------

    /// Apply an incoming `key:request` or `key:response`
    ///
    /// Stores the peer key, trusts it on first use when enabled, upgrades any
    /// session with the peer, and answers requests with our key.
    pub async fn handle_key_exchange_message(&self, message: &KeyExchangeMessage) -> Result<()> {
        let contact_id = message.origin();
        if contact_id == self.user_id {
            tracing::debug!("Ignoring key exchange message from ourselves");
            return Ok(());
        }

        self.keys
            .store_contact_key(contact_id, message.public_key())
            .await?;
        if self.options.verify_on_first_use {
            self.verification.trust_on_first_use(contact_id);
        }
        tracing::info!("Received public key from {}", contact_id);

        self.upgrade_session(contact_id).await;

        if let KeyExchangeMessage::Request { .. } = message {
            let identity = self.keys.initialize_user_keys().await?;
            let response = KeyExchangeMessage::Response {
                sender: self.user_id.clone(),
                public_key: identity.public_key.clone(),
            };
            self.transport
                .send_key_exchange(contact_id, response)
                .await
                .map_err(|e| {
                    Error::KeyExchangeFailed(format!("response to {} not sent: {}", contact_id, e))
                })?;
        }

        Ok(())
    }

    async fn upgrade_session(&self, contact_id: &str) {
        if !self.sessions.read().contains_key(contact_id) {
            return;
        }

        match self.keys.generate_shared_secret(contact_id).await {
            Some(secret) => {
                if let Some(session) = self.sessions.write().get_mut(contact_id) {
                    session.shared_secret = secret;
                    session.derivation = SecretDerivation::Ecdh;
                }
                tracing::info!("Session with {} established", contact_id);
            }
            None => {
                tracing::warn!(
                    "ECDH with {} failed, keeping provisional secret",
                    contact_id
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn decrypt_with_candidates(
        &self,
        contact_id: &str,
        message: &EncryptedMessage,
    ) -> Result<(String, Candidate)> {
        self.keys.initialize_user_keys().await?;
        let private_key = self.keys.private_key().ok_or(Error::NoExistingKeys)?;
        let ecdh = self.keys.generate_shared_secret(contact_id).await;
        let backend = self.keys.backend();

        for candidate in candidates::build(ecdh, &private_key, contact_id) {
            let result = backend.decrypt_message(message, &candidate.secret).await;
            let accepted = if message.has_mac() {
                result.verified
            } else {
                result.is_plausible()
            };

            tracing::debug!(
                "Candidate {} for {}: {}",
                candidate.derivation.as_str(),
                contact_id,
                if accepted { "accepted" } else { "rejected" }
            );

            if let (true, Some(plaintext)) = (accepted, result.message) {
                return Ok((plaintext, candidate));
            }
        }

        Err(Error::DecryptionFailed("no working secret found".into()))
    }

    fn adopt(&self, contact_id: &str, candidate: Candidate, timestamp: i64) {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(contact_id.to_string())
            .or_insert_with(|| ChatSession::new(contact_id, candidate.clone()));

        if session.shared_secret != candidate.secret {
            tracing::debug!(
                "Adopting {} secret for {}",
                candidate.derivation.as_str(),
                contact_id
            );
            session.shared_secret = candidate.secret;
            session.derivation = candidate.derivation;
        }
        session.record_message(timestamp);
    }

    fn append_history(&self, contact_id: &str, message: SecureMessage) {
        self.history
            .write()
            .entry(contact_id.to_string())
            .or_default()
            .push(message);
    }
}

// ============================================================================
// TESTS
// ============================================================================
