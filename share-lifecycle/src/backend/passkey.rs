use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{
    BackendError, EncryptedStorageBackend, KeyMaterial, SealedBackup, decrypt_with_stored_key,
    encode_cipher_text, encryption, new_storage_key,
};
use crate::models::{BackendId, BackupBlob};

const HKDF_INFO: &[u8] = b"share-lifecycle passkey v1";

/// Authenticator exposing a pseudo-random function keyed by a credential
/// that never leaves the device
#[async_trait]
pub trait PasskeyAuthenticator: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Evaluates the PRF on `salt`. Equal salts give equal outputs.
    async fn prf(&self, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, String>;
}

/// Authenticator backed by a secret held in memory
pub struct SoftwareAuthenticator {
    secret: Zeroizing<Vec<u8>>,
}

impl SoftwareAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret: Zeroizing::new(secret),
        }
    }
}

#[async_trait]
impl PasskeyAuthenticator for SoftwareAuthenticator {
    async fn is_available(&self) -> bool {
        !self.secret.is_empty()
    }

    async fn prf(&self, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, String> {
        encryption::derive_key(&self.secret, salt, b"prf").map_err(|e| e.to_string())
    }
}

/// Derives each backup key from the authenticator; nothing is stored
pub struct PasskeyBackend {
    authenticator: Arc<dyn PasskeyAuthenticator>,
}

impl PasskeyBackend {
    pub fn new(authenticator: Arc<dyn PasskeyAuthenticator>) -> Self {
        Self { authenticator }
    }

    async fn derive(&self, storage_key: &str) -> Result<Zeroizing<Vec<u8>>, String> {
        let prf = self.authenticator.prf(storage_key.as_bytes()).await?;
        encryption::derive_key(&prf, storage_key.as_bytes(), HKDF_INFO).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl EncryptedStorageBackend for PasskeyBackend {
    fn id(&self) -> BackendId {
        BackendId::Passkey
    }

    async fn validate_availability(&self) -> Result<(), BackendError> {
        if self.authenticator.is_available().await {
            Ok(())
        } else {
            Err(BackendError::Unavailable("no passkey authenticator".to_string()))
        }
    }

    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError> {
        let storage_key = new_storage_key();
        let key = self.derive(&storage_key).await.map_err(BackendError::Encryption)?;
        let cipher = encryption::encrypt_with_key(payload, &key)?;
        Ok(SealedBackup {
            blob: BackupBlob {
                cipher_text: encode_cipher_text(&cipher),
                storage_key,
                backend_id: BackendId::Passkey,
            },
            key: KeyMaterial::Key(key),
        })
    }

    async fn write(&self, _sealed: &SealedBackup) -> Result<(), BackendError> {
        Ok(())
    }

    async fn read(&self, storage_key: &str) -> Result<KeyMaterial, BackendError> {
        let key = self.derive(storage_key).await.map_err(BackendError::Read)?;
        Ok(KeyMaterial::Key(key))
    }

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
        decrypt_with_stored_key(blob, key)
    }
}
