//! # Siphera Core
//!
//! End-to-end encryption engine for peer-to-peer chat: identity keys,
//! per-contact sessions, self-readable sent messages, key verification and
//! tiered key storage. Message delivery belongs to the host; the engine only
//! needs a way to send key-exchange control messages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SIPHERA CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Retrieval  │─►│  Session    │─►│    Keys     │─►│  Strategy    │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Batches   │  │ - Fallback  │  │ - Identity  │  │ - Memory     │   │
//! │  │ - Placehold │  │ - ECDH      │  │ - Contacts  │  │ - Durable    │   │
//! │  │             │  │ - Candidates│  │ - Backup    │  │ - Backup     │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │  ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼───────┐   │
//! │  │ Sender Keys │  │ Verification│  │   Crypto    │  │   Storage    │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Self-keys │  │ - Finger-   │  │ - P-256     │  │ - HashMap    │   │
//! │  │ - PBKDF2    │  │   print     │  │ - AES-GCM   │  │ - SQLite     │   │
//! │  │             │  │ - Code/TOFU │  │ - ChaCha20  │  │              │   │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └──────────────┘   │
//! │                                                                         │
//! │                  Factory: probes backends once at startup               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Engine configuration
//! - [`crypto`] - Key pairs, ECDH, message encryption backends, backups
//! - [`storage`] - Memory and SQLite key-value backends
//! - [`security`] - Security levels and assessments
//! - [`strategy`] - Tiered key persistence
//! - [`factory`] - Backend selection
//! - [`keys`] - Identity and contact keys
//! - [`transport`] - Key-exchange control messages
//! - [`session`] - Per-contact chat sessions
//! - [`sender_keys`] - Self-keys for reading sent messages
//! - [`verification`] - Contact key verification
//! - [`retrieval`] - Batch decryption for display
//!
//! ## Usage
//!
//! ```ignore
//! use siphera_core::{EngineConfig, SipheraCore, transport::ChannelTransport};
//! use std::sync::Arc;
//!
//! let (transport, mut outbound) = ChannelTransport::new();
//! let core = SipheraCore::new(EngineConfig::default(), "alice", Arc::new(transport)).await?;
//!
//! let message = core.chat().send_encrypted_message("bob", "hello").await?;
//! // deliver `message` and everything on `outbound` to bob
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod crypto;
pub mod error;
pub mod factory;
pub mod keys;
pub mod retrieval;
pub mod security;
pub mod sender_keys;
pub mod session;
pub mod storage;
pub mod strategy;
pub mod time;
pub mod transport;
pub mod verification;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::EngineConfig;
pub use crypto::{CryptoBackend, DecryptionResult, EncryptedMessage, KeyPair, SharedSecret};
pub use error::{Error, Result};
pub use factory::{BackendFactory, CryptoConfig};
pub use keys::{ContactKey, KeyManagementService, StoredKeys};
pub use retrieval::{DisplayMessage, MessageRetrieval, RawMessage};
pub use security::{SecurityAssessment, SecurityLevel};
pub use sender_keys::SenderKeyService;
pub use session::{SecureChatService, SecureMessage, SessionInfo, SessionState};
pub use storage::StorageBackend;
pub use transport::{KeyExchangeMessage, KeyExchangeTransport};
pub use verification::{KeyVerificationService, VerificationStatus};

// ============================================================================
// CORE INSTANCE
// ============================================================================

use std::sync::Arc;

use session::SessionOptions;

/// One local user's engine: every service, wired together
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                       SIPHERA CORE LIFECYCLE                            │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. SipheraCore::new(config, user_id, transport)                       │
/// │        ├──► BackendFactory::auto_configure                             │
/// │        ├──► build keys, sender keys, verification, chat, retrieval     │
/// │        └──► load or generate the identity                              │
/// │                                                                         │
/// │  2. Operate                                                            │
/// │        chat().send_encrypted_message / receive_encrypted_message       │
/// │        chat().handle_key_exchange_message  ◄── host transport          │
/// │        retrieval().process_messages        ◄── host message store      │
/// │                                                                         │
/// │  3. Drop: secrets are zeroized, the durable tier stays on disk         │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct SipheraCore {
    user_id: String,
    config: EngineConfig,
    crypto: CryptoConfig,
    keys: Arc<KeyManagementService>,
    sender_keys: Arc<SenderKeyService>,
    verification: Arc<KeyVerificationService>,
    chat: Arc<SecureChatService>,
    retrieval: MessageRetrieval,
}

impl SipheraCore {
    /// Configure backends, build the services and load the identity
    pub async fn new(
        config: EngineConfig,
        user_id: impl Into<String>,
        transport: Arc<dyn KeyExchangeTransport>,
    ) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(Error::InvalidConfig("user id must not be empty".into()));
        }

        tracing::info!("Starting Siphera Core v{} for {}", version(), user_id);

        let crypto = BackendFactory::auto_configure(&config).await?;

        let keys = Arc::new(KeyManagementService::new(
            crypto.backend.clone(),
            crypto.strategy.clone(),
        ));
        let sender_keys = Arc::new(SenderKeyService::new(
            user_id.clone(),
            crypto.backend.clone(),
            Some(crypto.storage.clone()),
        ));
        let verification = Arc::new(KeyVerificationService::new());
        let chat = Arc::new(SecureChatService::new(
            user_id.clone(),
            keys.clone(),
            sender_keys.clone(),
            verification.clone(),
            transport,
            SessionOptions::from(&config),
        ));
        let retrieval = MessageRetrieval::new(user_id.clone(), chat.clone(), sender_keys.clone());

        let identity = keys.initialize_user_keys().await?;
        tracing::info!("Siphera Core ready, identity {}", identity.fingerprint);

        Ok(Self {
            user_id,
            config,
            crypto,
            keys,
            sender_keys,
            verification,
            chat,
            retrieval,
        })
    }

    /// Local user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Selected backends
    pub fn crypto_config(&self) -> &CryptoConfig {
        &self.crypto
    }

    /// Identity and contact keys
    pub fn keys(&self) -> &Arc<KeyManagementService> {
        &self.keys
    }

    /// Self-keys
    pub fn sender_keys(&self) -> &Arc<SenderKeyService> {
        &self.sender_keys
    }

    /// Contact verification
    pub fn verification(&self) -> &Arc<KeyVerificationService> {
        &self.verification
    }

    /// Chat sessions
    pub fn chat(&self) -> &Arc<SecureChatService> {
        &self.chat
    }

    /// Batch decryption
    pub fn retrieval(&self) -> &MessageRetrieval {
        &self.retrieval
    }

    /// Combined assessment of the selected backends
    pub async fn security_assessment(&self) -> SecurityAssessment {
        self.crypto.get_security_assessment().await
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Siphera Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
