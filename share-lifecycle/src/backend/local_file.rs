use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use zeroize::Zeroizing;

use super::{
    BackendError, EncryptedStorageBackend, KeyMaterial, SealedBackup, decrypt_with_stored_key,
    seal_with_fresh_key,
};
use crate::models::{BackendId, BackupBlob};
use crate::secure_fs::write_private;

/// Keeps backup keys as hex files in a local directory, one per storage key
pub struct LocalFileBackend {
    dir: PathBuf,
}

impl LocalFileBackend {
    /// File extension for key files
    const KEY_EXT: &'static str = "key";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, storage_key: &str) -> Result<PathBuf, BackendError> {
        // Storage keys are UUIDs; anything else could escape the directory
        let slot = uuid::Uuid::parse_str(storage_key)
            .map_err(|_| BackendError::Read(format!("invalid storage key: {}", storage_key)))?;
        Ok(self
            .dir
            .join(format!("{}.{}", slot.hyphenated(), Self::KEY_EXT)))
    }
}

#[async_trait]
impl EncryptedStorageBackend for LocalFileBackend {
    fn id(&self) -> BackendId {
        BackendId::LocalFile
    }

    async fn validate_availability(&self) -> Result<(), BackendError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", self.dir.display(), e)))?;
        let meta = fs::metadata(&self.dir)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", self.dir.display(), e)))?;
        if meta.permissions().readonly() {
            return Err(BackendError::Unavailable(format!(
                "{} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }

    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError> {
        seal_with_fresh_key(BackendId::LocalFile, payload)
    }

    async fn write(&self, sealed: &SealedBackup) -> Result<(), BackendError> {
        let KeyMaterial::Key(key) = &sealed.key else {
            return Err(BackendError::Write("local file backend stores raw keys only".to_string()));
        };
        let path = self
            .key_path(&sealed.blob.storage_key)
            .map_err(|e| BackendError::Write(e.to_string()))?;

        let encoded = Zeroizing::new(hex::encode(key.as_slice()));
        write_private(&path, encoded.as_bytes())
            .await
            .map_err(|e| BackendError::Write(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "backup key written");
        Ok(())
    }

    async fn read(&self, storage_key: &str) -> Result<KeyMaterial, BackendError> {
        let path = self.key_path(storage_key)?;
        let encoded = match fs::read_to_string(&path).await {
            Ok(text) => Zeroizing::new(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::KeyNotFound(storage_key.to_string()));
            }
            Err(e) => return Err(BackendError::Read(format!("{}: {}", path.display(), e))),
        };
        let key = hex::decode(encoded.trim())
            .map_err(|e| BackendError::Read(format!("key file is not hex: {}", e)))?;
        Ok(KeyMaterial::Key(Zeroizing::new(key)))
    }

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
        decrypt_with_stored_key(blob, key)
    }
}
