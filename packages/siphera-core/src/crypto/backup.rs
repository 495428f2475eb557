//! Password-sealed backups.
//!
//! ```text
//! base64( JSON {
//!     "version":    1,
//!     "salt":       base64(16 random bytes),
//!     "nonce":      base64(12 bytes),
//!     "ciphertext": base64(AES-256-GCM(PBKDF2(password, salt, 100k), payload))
//! })
//! ```
//!
//! The key depends only on the password and the embedded salt, never on the
//! storage master key, so a backup can be restored on a fresh install. Salt
//! and key both come from the selected [`CryptoBackend`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use super::{decrypt, encrypt, CryptoBackend, Nonce};
use crate::error::{Error, Result};

/// Current backup format version
pub const BACKUP_VERSION: u32 = 1;

/// Salt length in bytes
pub const SALT_SIZE: usize = 16;

/// Associated data binding the ciphertext to the backup format
const BACKUP_AAD: &[u8] = b"siphera-backup-v1";

#[derive(Serialize, Deserialize)]
struct BackupEnvelope {
    version: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Seal `payload` under `password`
pub async fn seal(backend: &dyn CryptoBackend, payload: &[u8], password: &str) -> Result<String> {
    let salt = backend.generate_random_bytes(SALT_SIZE);

    let key = backend.derive_key(password, &salt).await?;
    let (nonce, ciphertext) = encrypt(&key, payload, BACKUP_AAD)?;

    let envelope = BackupEnvelope {
        version: BACKUP_VERSION,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce.as_bytes()),
        ciphertext: BASE64.encode(ciphertext),
    };

    Ok(BASE64.encode(serde_json::to_vec(&envelope)?))
}

/// Open a blob produced by [`seal`]
///
/// Every failure, including a wrong password, is reported as
/// `BackupImportFailed`.
pub async fn open(backend: &dyn CryptoBackend, blob: &str, password: &str) -> Result<Vec<u8>> {
    let json = BASE64
        .decode(blob.trim())
        .map_err(|_| Error::BackupImportFailed("backup is not valid base64".into()))?;
    let envelope: BackupEnvelope = serde_json::from_slice(&json)
        .map_err(|e| Error::BackupImportFailed(format!("malformed backup: {}", e)))?;

    if envelope.version != BACKUP_VERSION {
        return Err(Error::BackupImportFailed(format!(
            "unsupported backup version {}",
            envelope.version
        )));
    }

    let decode = |field: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|_| Error::BackupImportFailed(format!("invalid {} field", field)))
    };
    let salt = decode("salt", &envelope.salt)?;
    let nonce = Nonce::from_slice(&decode("nonce", &envelope.nonce)?)
        .map_err(|_| Error::BackupImportFailed("invalid nonce length".into()))?;
    let ciphertext = decode("ciphertext", &envelope.ciphertext)?;

    let key = backend.derive_key(password, &salt).await?;
    decrypt(&key, &nonce, &ciphertext, BACKUP_AAD)
        .map_err(|_| Error::BackupImportFailed("wrong password or corrupted backup".into()))
}
