//! Encrypted storage backends for backup shares.
//!
//! A backend decides where the decryption key of a backup lives. The
//! orchestrator drives every backend through the same
//! [`EncryptedStorageBackend`] contract and only branches on
//! [`KeySource`]: password backends never store or read a key.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::config::LifecycleConfig;
use crate::models::{BackendId, BackupBlob};

pub mod encryption;
mod local_file;
mod passkey;
mod password;
mod vault;

pub use local_file::LocalFileBackend;
pub use passkey::{PasskeyAuthenticator, PasskeyBackend, SoftwareAuthenticator};
pub use password::PasswordBackend;
pub use vault::{KeyVault, MemoryKeyVault, VaultBackend};

/// Error types that can occur inside a storage backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("No password provided")]
    PasswordMissing,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("No key stored under {0}")]
    KeyNotFound(String),
}

/// Where a backend's decryption key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Derived from a password supplied by the caller on every use
    Password,
    /// Written by the backend at backup time and read back at recovery
    Stored,
}

/// Decryption key material
#[derive(Clone)]
pub enum KeyMaterial {
    Password(Zeroizing<String>),
    Key(Zeroizing<Vec<u8>>),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Password(_) => f.write_str("KeyMaterial::Password(<redacted>)"),
            KeyMaterial::Key(_) => f.write_str("KeyMaterial::Key(<redacted>)"),
        }
    }
}

/// Output of [`EncryptedStorageBackend::encrypt`]: the blob for the caller
/// and the key material the backend must persist with `write`
#[derive(Debug, Clone)]
pub struct SealedBackup {
    pub blob: BackupBlob,
    pub key: KeyMaterial,
}

/// Contract every backup storage backend satisfies
#[async_trait]
pub trait EncryptedStorageBackend: Send + Sync {
    fn id(&self) -> BackendId;

    fn key_source(&self) -> KeySource {
        KeySource::Stored
    }

    /// Checks the backend can be used right now. Called before any remote
    /// work so unavailable backends fail fast.
    async fn validate_availability(&self) -> Result<(), BackendError>;

    /// Encrypts a serialized backup payload under a fresh storage key
    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError>;

    /// Encrypts a payload under key material that opened an earlier backup.
    /// Only password backends use `key`; the rest seal under a fresh key.
    async fn encrypt_under(&self, payload: &[u8], key: &KeyMaterial) -> Result<SealedBackup, BackendError> {
        let _ = key;
        self.encrypt(payload).await
    }

    /// Persists the key material of a sealed backup
    async fn write(&self, sealed: &SealedBackup) -> Result<(), BackendError>;

    /// Loads the key material stored for `storage_key`
    async fn read(&self, storage_key: &str) -> Result<KeyMaterial, BackendError>;

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError>;
}

/// The backends configured for this device, resolved once at start-up
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<BackendId, Arc<dyn EncryptedStorageBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its own id, replacing any previous one
    pub fn with(mut self, backend: Arc<dyn EncryptedStorageBackend>) -> Self {
        self.insert(backend);
        self
    }

    /// Backends that need nothing beyond the configuration: password and
    /// local file. Local keys go to `localBackupDir`, or `backups/` under
    /// `data_dir` when unset.
    pub fn from_config(config: &LifecycleConfig, data_dir: &Path) -> Self {
        let backup_dir = config
            .local_backup_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("backups"));
        Self::new()
            .with(Arc::new(PasswordBackend::new(config.password.clone())))
            .with(Arc::new(LocalFileBackend::new(backup_dir)))
    }

    pub fn insert(&mut self, backend: Arc<dyn EncryptedStorageBackend>) {
        self.backends.insert(backend.id(), backend);
    }

    pub fn get(&self, id: BackendId) -> Option<Arc<dyn EncryptedStorageBackend>> {
        self.backends.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.backends.keys().copied().collect()
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet").field("backends", &self.ids()).finish()
    }
}

pub(crate) fn encode_cipher_text(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode(bytes)
}

pub(crate) fn decode_cipher_text(text: &str) -> Result<Vec<u8>, BackendError> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD
        .decode(text.trim())
        .map_err(|e| BackendError::Decryption(format!("cipher text is not base64: {}", e)))
}

pub(crate) fn new_storage_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared body of `decrypt` for backends holding a raw key
pub(crate) fn decrypt_with_stored_key(blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
    match key {
        KeyMaterial::Key(key) => encryption::decrypt_with_key(&decode_cipher_text(&blob.cipher_text)?, key),
        KeyMaterial::Password(_) => Err(BackendError::Decryption(
            "backend expects a stored key, got a password".to_string(),
        )),
    }
}

/// Shared body of `encrypt` for backends holding a raw key
pub(crate) fn seal_with_fresh_key(id: BackendId, payload: &[u8]) -> Result<SealedBackup, BackendError> {
    let key = encryption::generate_key();
    let cipher = encryption::encrypt_with_key(payload, &key)?;
    Ok(SealedBackup {
        blob: BackupBlob {
            cipher_text: encode_cipher_text(&cipher),
            storage_key: new_storage_key(),
            backend_id: id,
        },
        key: KeyMaterial::Key(key),
    })
}
