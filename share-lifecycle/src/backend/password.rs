use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{
    BackendError, EncryptedStorageBackend, KeyMaterial, KeySource, SealedBackup, decode_cipher_text,
    encode_cipher_text, encryption, new_storage_key,
};
use crate::models::{BackendId, BackupBlob};

/// Backups sealed under a user password. Nothing is stored; the password is
/// the key.
pub struct PasswordBackend {
    password: Option<Zeroizing<String>>,
}

impl PasswordBackend {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()).map(Zeroizing::new),
        }
    }

    fn password(&self) -> Result<&str, BackendError> {
        self.password
            .as_ref()
            .map(|p| p.as_str())
            .ok_or(BackendError::PasswordMissing)
    }

    fn seal(payload: &[u8], password: &str) -> Result<SealedBackup, BackendError> {
        if password.is_empty() {
            return Err(BackendError::PasswordMissing);
        }
        let cipher = encryption::encrypt_with_password(payload, password)?;
        Ok(SealedBackup {
            blob: BackupBlob {
                cipher_text: encode_cipher_text(&cipher),
                storage_key: new_storage_key(),
                backend_id: BackendId::Password,
            },
            key: KeyMaterial::Password(Zeroizing::new(password.to_string())),
        })
    }
}

#[async_trait]
impl EncryptedStorageBackend for PasswordBackend {
    fn id(&self) -> BackendId {
        BackendId::Password
    }

    fn key_source(&self) -> KeySource {
        KeySource::Password
    }

    async fn validate_availability(&self) -> Result<(), BackendError> {
        self.password().map(|_| ())
    }

    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError> {
        Self::seal(payload, self.password()?)
    }

    async fn encrypt_under(&self, payload: &[u8], key: &KeyMaterial) -> Result<SealedBackup, BackendError> {
        match key {
            KeyMaterial::Password(password) => Self::seal(payload, password),
            KeyMaterial::Key(_) => Err(BackendError::Encryption(
                "password backend expects a password".to_string(),
            )),
        }
    }

    async fn write(&self, _sealed: &SealedBackup) -> Result<(), BackendError> {
        Ok(())
    }

    async fn read(&self, _storage_key: &str) -> Result<KeyMaterial, BackendError> {
        Ok(KeyMaterial::Password(Zeroizing::new(self.password()?.to_string())))
    }

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
        match key {
            KeyMaterial::Password(password) => {
                encryption::decrypt_with_password(&decode_cipher_text(&blob.cipher_text)?, password)
            }
            KeyMaterial::Key(_) => Err(BackendError::Decryption(
                "password backend expects a password".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_password_unavailable() {
        let backend = PasswordBackend::new(None);
        assert_eq!(backend.validate_availability().await, Err(BackendError::PasswordMissing));
        assert!(matches!(backend.encrypt(b"x").await, Err(BackendError::PasswordMissing)));

        let empty = PasswordBackend::new(Some(String::new()));
        assert_eq!(empty.validate_availability().await, Err(BackendError::PasswordMissing));
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt_with_password() {
        let backend = PasswordBackend::new(Some("correct horse".to_string()));
        let sealed = backend.encrypt(b"payload").await.unwrap();
        assert_eq!(sealed.blob.backend_id, BackendId::Password);

        let key = KeyMaterial::Password(Zeroizing::new("correct horse".to_string()));
        assert_eq!(backend.decrypt(&sealed.blob, &key).await.unwrap(), b"payload");

        let wrong = KeyMaterial::Password(Zeroizing::new("battery staple".to_string()));
        assert!(matches!(
            backend.decrypt(&sealed.blob, &wrong).await,
            Err(BackendError::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypt_under_caller_password() {
        let backend = PasswordBackend::new(None);
        let key = KeyMaterial::Password(Zeroizing::new("from the caller".to_string()));
        let sealed = backend.encrypt_under(b"payload", &key).await.unwrap();
        assert_eq!(backend.decrypt(&sealed.blob, &key).await.unwrap(), b"payload");

        let configured = PasswordBackend::new(Some("configured".to_string()));
        let sealed = configured.encrypt_under(b"payload", &key).await.unwrap();
        let other = KeyMaterial::Password(Zeroizing::new("configured".to_string()));
        assert!(configured.decrypt(&sealed.blob, &other).await.is_err());
        assert_eq!(configured.decrypt(&sealed.blob, &key).await.unwrap(), b"payload");
    }
}
