//! # Error Handling
//!
//! This module provides the error types for Siphera Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Core Errors                                                       │
//! │  │   └── NoCryptoBackend       - No crypto backend passed its probe    │
//! │  │                                                                      │
//! │  ├── Key Errors                                                        │
//! │  │   ├── KeyGenerationFailed   - Entropy/API failure                   │
//! │  │   ├── NoExistingKeys        - Nothing stored yet (caller generates) │
//! │  │   ├── KeyExchangeUnavailable- Contact public key unknown            │
//! │  │   ├── KeyDerivationFailed   - KDF failure                           │
//! │  │   ├── InvalidKey            - Malformed key material                │
//! │  │   └── CorruptIdentity       - Stored identity unusable              │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncryptionFailed      - Encryption operation failed           │
//! │  │   ├── DecryptionFailed      - MAC mismatch or candidates exhausted  │
//! │  │   └── LegacyMessageIncompatible - Predates the legacy cutoff        │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageUnavailable    - Durable tier absent (non-fatal)       │
//! │  │   ├── StorageReadError / StorageWriteError                          │
//! │  │   ├── StorageCapacityExceeded                                       │
//! │  │   ├── DatabaseError                                                 │
//! │  │   └── BackupImportFailed    - Bad password or corrupt blob          │
//! │  │                                                                      │
//! │  ├── Session Errors                                                    │
//! │  │   ├── SessionNotFound                                               │
//! │  │   └── TransportError                                                │
//! │  │                                                                      │
//! │  └── Verification Errors                                               │
//! │      └── VerificationRequestNotFound                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//!
//! Low-level failures are folded into `verified = false` or `None` wherever
//! the caller has a fallback (secret candidates, key presence checks). Only
//! conditions with no fallback surface as `Err` to the caller.

use thiserror::Error;

/// Result type alias for Siphera Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Siphera Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Core Errors (100-199)
    // ========================================================================

    /// Neither the native nor the software crypto backend is usable
    #[error("No usable crypto backend: {0}")]
    NoCryptoBackend(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Key Errors (200-299)
    // ========================================================================

    /// Key pair generation failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// No keys have been stored yet
    #[error("No existing keys found")]
    NoExistingKeys,

    /// The contact's public key has not been exchanged yet
    #[error("Key exchange unavailable for contact {0}")]
    KeyExchangeUnavailable(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The local identity could not be loaded or used
    #[error("Local identity is corrupt: {0}")]
    CorruptIdentity(String),

    /// ECDH key agreement failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Message was produced before the current protocol scheme
    #[error("LEGACY_MESSAGE_INCOMPATIBLE: message timestamp {timestamp} predates cutoff {cutoff}")]
    LegacyMessageIncompatible {
        /// Timestamp carried by the message (ms)
        timestamp: i64,
        /// Configured cutoff (ms)
        cutoff: i64,
    },

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Durable storage tier is not available in this environment
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Write would exceed the store's capacity
    #[error("Storage capacity exceeded: {used} + {requested} bytes > {capacity} bytes")]
    StorageCapacityExceeded {
        /// Bytes already in use
        used: usize,
        /// Bytes requested by this write
        requested: usize,
        /// Total capacity
        capacity: usize,
    },

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Backup import failed (wrong password or corrupt blob)
    #[error("Backup import failed: {0}")]
    BackupImportFailed(String),

    // ========================================================================
    // Session Errors (500-599)
    // ========================================================================

    /// No session with the given contact
    #[error("No chat session with {0}")]
    SessionNotFound(String),

    /// Transport collaborator rejected a key-exchange message
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Sender key id could not be parsed
    #[error("Invalid sender key id: {0}")]
    InvalidSenderKeyId(String),

    // ========================================================================
    // Verification Errors (600-699)
    // ========================================================================

    /// No pending verification between the two users
    #[error("No verification request between {0} and {1}")]
    VerificationRequestNotFound(String, String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Core
    /// - 200-299: Keys
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Session
    /// - 600-699: Verification
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Core (100-199)
            Error::NoCryptoBackend(_) => 100,
            Error::InvalidConfig(_) => 101,

            // Keys (200-299)
            Error::KeyGenerationFailed(_) => 200,
            Error::NoExistingKeys => 201,
            Error::KeyExchangeUnavailable(_) => 202,
            Error::KeyDerivationFailed(_) => 203,
            Error::InvalidKey(_) => 204,
            Error::CorruptIdentity(_) => 205,
            Error::KeyExchangeFailed(_) => 206,

            // Crypto (300-399)
            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,
            Error::LegacyMessageIncompatible { .. } => 302,

            // Storage (400-499)
            Error::StorageUnavailable(_) => 400,
            Error::StorageReadError(_) => 401,
            Error::StorageWriteError(_) => 402,
            Error::StorageCapacityExceeded { .. } => 403,
            Error::DatabaseError(_) => 404,
            Error::BackupImportFailed(_) => 405,

            // Session (500-599)
            Error::SessionNotFound(_) => 500,
            Error::TransportError(_) => 501,
            Error::InvalidSenderKeyId(_) => 502,

            // Verification (600-699)
            Error::VerificationRequestNotFound(_, _) => 600,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors leave the engine usable: the caller can retry,
    /// fall back to a provisional session, or keep running memory-only.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::KeyExchangeUnavailable(_)
                | Error::StorageUnavailable(_)
                | Error::TransportError(_)
                | Error::NoExistingKeys
        )
    }

    /// Check if the message should be shown as unreadable instead of failing
    pub fn is_unreadable_message(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed(_) | Error::LegacyMessageIncompatible { .. }
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::DeserializationError(format!("Invalid base64: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NoCryptoBackend("test".into()).code(), 100);
        assert_eq!(Error::KeyGenerationFailed("test".into()).code(), 200);
        assert_eq!(Error::EncryptionFailed("test".into()).code(), 300);
        assert_eq!(Error::StorageUnavailable("test".into()).code(), 400);
        assert_eq!(Error::SessionNotFound("bob".into()).code(), 500);
        assert_eq!(
            Error::VerificationRequestNotFound("a".into(), "b".into()).code(),
            600
        );
        assert_eq!(Error::Internal("test".into()).code(), 900);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::KeyExchangeUnavailable("bob".into()).is_recoverable());
        assert!(Error::StorageUnavailable("disabled".into()).is_recoverable());
        assert!(!Error::NoCryptoBackend("none".into()).is_recoverable());
        assert!(!Error::DecryptionFailed("x".into()).is_recoverable());
    }

    #[test]
    fn test_legacy_message_display() {
        let err = Error::LegacyMessageIncompatible {
            timestamp: 1,
            cutoff: 2,
        };
        assert!(err.to_string().starts_with("LEGACY_MESSAGE_INCOMPATIBLE"));
        assert!(err.is_unreadable_message());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.code(), 901);
    }
}
