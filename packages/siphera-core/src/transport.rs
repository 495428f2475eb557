//! # Transport Seam
//!
//! The engine does not deliver messages itself. It hands key-exchange control
//! messages to a [`KeyExchangeTransport`] and is fed incoming ones through
//! `SecureChatService::handle_key_exchange_message`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KEY EXCHANGE                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Alice                                   Bob                           │
//! │    │                                      │                             │
//! │    │  {"type":"key:request",              │                             │
//! │    │   "requester":"alice",               │                             │
//! │    │   "requesterPublicKey":"..."}        │                             │
//! │    │ ───────────────────────────────────► │  store alice's key          │
//! │    │                                      │                             │
//! │    │  {"type":"key:response",             │                             │
//! │    │   "sender":"bob",                    │                             │
//! │    │   "publicKey":"..."}                 │                             │
//! │    │ ◄─────────────────────────────────── │                             │
//! │    │  store bob's key,                    │                             │
//! │    │  provisional → established           │                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Key-exchange control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KeyExchangeMessage {
    /// Ask a contact for their public key, offering ours
    #[serde(rename = "key:request", rename_all = "camelCase")]
    Request {
        /// Requesting user id
        requester: String,
        /// Requester's public key
        requester_public_key: String,
    },
    /// Answer to a request
    #[serde(rename = "key:response", rename_all = "camelCase")]
    Response {
        /// Answering user id
        sender: String,
        /// Sender's public key
        public_key: String,
    },
}

impl KeyExchangeMessage {
    /// User id of the party that produced the message
    pub fn origin(&self) -> &str {
        match self {
            Self::Request { requester, .. } => requester,
            Self::Response { sender, .. } => sender,
        }
    }

    /// Public key carried by the message
    pub fn public_key(&self) -> &str {
        match self {
            Self::Request {
                requester_public_key,
                ..
            } => requester_public_key,
            Self::Response { public_key, .. } => public_key,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::DeserializationError(format!("Invalid key exchange message: {}", e)))
    }
}

/// Outgoing side of the transport collaborator
#[async_trait]
pub trait KeyExchangeTransport: Send + Sync {
    /// Deliver a control message to `recipient`
    async fn send_key_exchange(&self, recipient: &str, message: KeyExchangeMessage) -> Result<()>;
}

/// A control message queued by [`ChannelTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundKeyExchange {
    /// Destination user id
    pub recipient: String,
    /// The message
    pub message: KeyExchangeMessage,
}

/// In-process transport over a tokio channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundKeyExchange>,
}

impl ChannelTransport {
    /// Create the transport and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundKeyExchange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl KeyExchangeTransport for ChannelTransport {
    async fn send_key_exchange(&self, recipient: &str, message: KeyExchangeMessage) -> Result<()> {
        self.tx
            .send(OutboundKeyExchange {
                recipient: recipient.to_string(),
                message,
            })
            .map_err(|_| Error::TransportError("key exchange channel closed".into()))
    }
}

/// Transport that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl KeyExchangeTransport for NullTransport {
    async fn send_key_exchange(&self, recipient: &str, _message: KeyExchangeMessage) -> Result<()> {
        tracing::debug!("Dropping key exchange message for {}", recipient);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let message = KeyExchangeMessage::Request {
            requester: "alice".into(),
            requester_public_key: "PUB".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "key:request");
        assert_eq!(json["requester"], "alice");
        assert_eq!(json["requesterPublicKey"], "PUB");
    }

    #[test]
    fn test_response_parses() {
        let message = KeyExchangeMessage::from_json(
            r#"{"type":"key:response","sender":"bob","publicKey":"PUB"}"#,
        )
        .unwrap();

        assert_eq!(message.origin(), "bob");
        assert_eq!(message.public_key(), "PUB");
        assert!(KeyExchangeMessage::from_json(r#"{"type":"key:other"}"#).is_err());
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::new();
        let message = KeyExchangeMessage::Response {
            sender: "bob".into(),
            public_key: "PUB".into(),
        };

        transport.send_key_exchange("alice", message.clone()).await.unwrap();

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.recipient, "alice");
        assert_eq!(queued.message, message);
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);

        let err = transport
            .send_key_exchange(
                "alice",
                KeyExchangeMessage::Response {
                    sender: "bob".into(),
                    public_key: "PUB".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportError(_)));
    }
}
