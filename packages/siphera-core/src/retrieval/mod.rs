//! # Message Retrieval
//!
//! Turns a batch of persisted messages into something a UI can render.
//!
//! ```text
//! RawMessage
//!    │
//!    ├── sender == me, senderReference present ──► SenderKeyService
//!    ├── sender != me, encryptedData present   ──► SecureChatService
//!    └── anything else, or decryption error    ──► placeholder, can_read = false
//! ```
//!
//! One bad message never aborts the batch.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::crypto::EncryptedMessage;
use crate::error::{Error, Result};
use crate::sender_keys::{SenderKeyService, SenderReference};
use crate::session::SecureChatService;

/// Content shown for messages that cannot be decrypted
pub const UNREADABLE_PLACEHOLDER: &str = "[Unable to decrypt message]";

/// A message as it comes out of the host's message store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Message id
    pub id: String,
    /// Sender user id
    pub sender_id: String,
    /// Unix ms
    pub timestamp: i64,
    /// Envelope for the recipient
    #[serde(default)]
    pub encrypted_data: Option<EncryptedMessage>,
    /// Self-encrypted copy for the sender
    #[serde(default)]
    pub sender_reference: Option<SenderReference>,
}

/// A message ready to render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    /// Message id
    pub id: String,
    /// Sender user id
    pub sender_id: String,
    /// Unix ms
    pub timestamp: i64,
    /// Plaintext or [`UNREADABLE_PLACEHOLDER`]
    pub content: String,
    /// Sent by the local user
    pub is_mine: bool,
    /// Whether `content` is real plaintext
    pub can_read: bool,
}

/// Decrypts stored messages for the local user
pub struct MessageRetrieval {
    user_id: String,
    chat: Arc<SecureChatService>,
    sender_keys: Arc<SenderKeyService>,
}

impl MessageRetrieval {
    /// Create a retriever for `user_id`
    pub fn new(
        user_id: impl Into<String>,
        chat: Arc<SecureChatService>,
        sender_keys: Arc<SenderKeyService>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            chat,
            sender_keys,
        }
    }

    /// Decrypt a batch, keeping input order
    pub async fn process_messages(&self, messages: &[RawMessage]) -> Vec<DisplayMessage> {
        let mut display = Vec::with_capacity(messages.len());
        let mut unreadable = 0usize;

        for message in messages {
            let is_mine = message.sender_id == self.user_id;
            let (content, can_read) = match self.decrypt(message, is_mine).await {
                Ok(plaintext) => (plaintext, true),
                Err(e) => {
                    if e.is_unreadable_message() {
                        tracing::debug!("Message {} is unreadable: {}", message.id, e);
                    } else {
                        tracing::warn!("Message {} failed to load: {}", message.id, e);
                    }
                    unreadable += 1;
                    (UNREADABLE_PLACEHOLDER.to_string(), false)
                }
            };

            display.push(DisplayMessage {
                id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                timestamp: message.timestamp,
                content,
                is_mine,
                can_read,
            });
        }

        tracing::debug!(
            "Processed {} messages, {} unreadable",
            messages.len(),
            unreadable
        );
        display
    }

    async fn decrypt(&self, message: &RawMessage, is_mine: bool) -> Result<String> {
        match (is_mine, &message.sender_reference, &message.encrypted_data) {
            (true, Some(reference), _) => self.sender_keys.decrypt_for_sender(reference).await,
            (false, _, Some(envelope)) => self.chat.decrypt_message(&message.sender_id, envelope).await,
            _ => Err(Error::DecryptionFailed("no decryptable content".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoBackend, NativeCryptoBackend};
    use crate::keys::KeyManagementService;
    use crate::session::SessionOptions;
    use crate::storage::MemoryStorage;
    use crate::strategy::KeyManagementStrategy;
    use crate::transport::{ChannelTransport, KeyExchangeTransport, NullTransport};
    use crate::verification::KeyVerificationService;

    struct Peer {
        chat: Arc<SecureChatService>,
        retrieval: MessageRetrieval,
    }

    fn peer(user_id: &str, transport: Arc<dyn KeyExchangeTransport>) -> Peer {
        let backend: Arc<dyn CryptoBackend> = Arc::new(NativeCryptoBackend::new());
        let strategy = Arc::new(KeyManagementStrategy::new(
            backend.clone(),
            Arc::new(MemoryStorage::new()),
            None,
        ));
        let keys = Arc::new(KeyManagementService::new(backend.clone(), strategy));
        let sender_keys = Arc::new(SenderKeyService::new(user_id, backend, None));
        let chat = Arc::new(SecureChatService::new(
            user_id,
            keys,
            sender_keys.clone(),
            Arc::new(KeyVerificationService::new()),
            transport,
            SessionOptions::default(),
        ));
        let retrieval = MessageRetrieval::new(user_id, chat.clone(), sender_keys);
        Peer { chat, retrieval }
    }

    fn stored(sender: &str, message: &crate::session::SecureMessage) -> RawMessage {
        RawMessage {
            id: message.id.clone(),
            sender_id: sender.to_string(),
            timestamp: message.timestamp,
            encrypted_data: Some(message.encrypted_data.clone()),
            sender_reference: message.sender_reference.clone(),
        }
    }

    #[tokio::test]
    async fn test_mixed_batch() {
        let (alice_transport, mut alice_rx) = ChannelTransport::new();
        let (bob_transport, mut bob_rx) = ChannelTransport::new();
        let alice = peer("alice", Arc::new(alice_transport));
        let bob = peer("bob", Arc::new(bob_transport));

        // Key exchange
        alice.chat.get_or_create_session("bob").await.unwrap();
        let request = alice_rx.recv().await.unwrap().message;
        bob.chat.handle_key_exchange_message(&request).await.unwrap();
        let response = bob_rx.recv().await.unwrap().message;
        alice.chat.handle_key_exchange_message(&response).await.unwrap();

        let mine = alice.chat.send_encrypted_message("bob", "from alice").await.unwrap();
        let theirs = bob.chat.send_encrypted_message("alice", "from bob").await.unwrap();

        let empty = RawMessage {
            id: "empty".into(),
            sender_id: "bob".into(),
            timestamp: theirs.timestamp,
            encrypted_data: None,
            sender_reference: None,
        };

        let batch = vec![stored("alice", &mine), stored("bob", &theirs), empty];
        let display = alice.retrieval.process_messages(&batch).await;

        assert_eq!(display.len(), 3);
        assert_eq!(display[0].content, "from alice");
        assert!(display[0].is_mine && display[0].can_read);
        assert_eq!(display[1].content, "from bob");
        assert!(!display[1].is_mine && display[1].can_read);
        assert_eq!(display[2].content, UNREADABLE_PLACEHOLDER);
        assert!(!display[2].can_read);

        // Retrieval does not grow the session history
        assert_eq!(alice.chat.chat_history("bob").len(), 1);
    }

    #[tokio::test]
    async fn test_own_message_without_reference_is_placeholder() {
        let alice = peer("alice", Arc::new(NullTransport));
        let sent = alice.chat.send_encrypted_message("bob", "hello").await.unwrap();

        let mut raw = stored("alice", &sent);
        raw.sender_reference = None;

        let display = alice.retrieval.process_messages(&[raw]).await;
        assert_eq!(display[0].content, UNREADABLE_PLACEHOLDER);
        assert!(display[0].is_mine);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let alice = peer("alice", Arc::new(NullTransport));
        let bob = peer("bob", Arc::new(NullTransport));

        // Bob never learned alice's key and alice cannot derive bob's fallback
        let unreadable = bob.chat.send_encrypted_message("alice", "lost").await.unwrap();
        let mut legacy = stored("bob", &unreadable);
        legacy.id = "legacy".into();
        if let Some(envelope) = legacy.encrypted_data.as_mut() {
            envelope.timestamp = 1_000;
        }
        let mine = alice.chat.send_encrypted_message("bob", "kept").await.unwrap();

        let display = alice
            .retrieval
            .process_messages(&[stored("bob", &unreadable), legacy, stored("alice", &mine)])
            .await;

        assert!(!display[0].can_read);
        assert!(!display[1].can_read);
        assert_eq!(display[2].content, "kept");
    }

    #[tokio::test]
    async fn test_malformed_sender_key_id_is_placeholder() {
        let alice = peer("alice", Arc::new(NullTransport));
        let sent = alice.chat.send_encrypted_message("bob", "hello").await.unwrap();

        let mut raw = stored("alice", &sent);
        if let Some(reference) = raw.sender_reference.as_mut() {
            reference.key_id = "not-a-sender-key".into();
        }

        let err = alice.retrieval.decrypt(&raw, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSenderKeyId(_)));
        assert!(!err.is_unreadable_message());

        let display = alice.retrieval.process_messages(&[raw]).await;
        assert_eq!(display[0].content, UNREADABLE_PLACEHOLDER);
        assert!(!display[0].can_read);
    }

    #[test]
    fn test_raw_message_parses_without_optional_fields() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"id":"m1","senderId":"bob","timestamp":1}"#).unwrap();

        assert!(raw.encrypted_data.is_none());
        assert!(raw.sender_reference.is_none());
    }
}
