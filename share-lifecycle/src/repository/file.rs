//! Encrypted on-disk share repository.
//!
//! The wallet record is stored as JSON sealed with AES-256-GCM under a
//! random per-device key. The key lives next to the record in its own file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{RepositoryError, ShareRepository};
use crate::backend::encryption::{self, KEY_LEN};
use crate::models::WalletRecord;
use crate::secure_fs::write_private;

pub struct FileShareRepository {
    base_path: PathBuf,
    device_key: OnceCell<Zeroizing<Vec<u8>>>,
}

impl FileShareRepository {
    /// File name for the sealed wallet record
    const RECORD_FILE: &'static str = "wallet.enc";

    /// File name for the device key
    const DEVICE_KEY_FILE: &'static str = "device.key";

    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            device_key: OnceCell::new(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn record_path(&self) -> PathBuf {
        self.base_path.join(Self::RECORD_FILE)
    }

    async fn device_key(&self) -> Result<&[u8], RepositoryError> {
        let key = self
            .device_key
            .get_or_try_init(|| async { self.load_or_create_device_key().await })
            .await?;
        Ok(key.as_slice())
    }

    async fn load_or_create_device_key(&self) -> Result<Zeroizing<Vec<u8>>, RepositoryError> {
        let path = self.base_path.join(Self::DEVICE_KEY_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => {
                let text = Zeroizing::new(text);
                let key = hex::decode(text.trim())
                    .map_err(|e| RepositoryError::Corrupt(format!("device key is not hex: {}", e)))?;
                if key.len() != KEY_LEN {
                    return Err(RepositoryError::Corrupt(format!(
                        "device key has {} bytes, expected {}",
                        key.len(),
                        KEY_LEN
                    )));
                }
                Ok(Zeroizing::new(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.base_path).await?;
                let key = encryption::generate_key();
                write_private(&path, hex::encode(key.as_slice()).as_bytes()).await?;
                info!(path = %path.display(), "created device key");
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ShareRepository for FileShareRepository {
    async fn validate_availability(&self) -> Result<(), RepositoryError> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| RepositoryError::Unavailable(format!("{}: {}", self.base_path.display(), e)))?;
        self.device_key().await.map(|_| ())
    }

    async fn load(&self) -> Result<Option<WalletRecord>, RepositoryError> {
        let sealed = match fs::read(self.record_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = self.device_key().await?;
        let plain = Zeroizing::new(
            encryption::decrypt_with_key(&sealed, key)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?,
        );
        let record = serde_json::from_slice(&plain).map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
        Ok(Some(record))
    }

    async fn commit(&self, record: &WalletRecord) -> Result<(), RepositoryError> {
        fs::create_dir_all(&self.base_path).await?;
        let key = self.device_key().await?;
        let plain = Zeroizing::new(
            serde_json::to_vec(record).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        );
        let sealed =
            encryption::encrypt_with_key(&plain, key).map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        // Readers see either the old record or the new one
        let path = self.record_path();
        let tmp = path.with_extension("enc.tmp");
        write_private(&tmp, &sealed).await?;
        fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), state = ?record.state(), "wallet record committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Curve, ShareMaterial, WalletState};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record() -> WalletRecord {
        let mut shares = BTreeMap::new();
        shares.insert(Curve::Ed25519, ShareMaterial::new(Curve::Ed25519, "pair", "v6", "c0ffee"));
        let mut record = WalletRecord::empty();
        record.activate("addr".to_string(), shares);
        record
    }

    #[tokio::test]
    async fn test_commit_and_reload() {
        let dir = tempdir().unwrap();
        let repo = FileShareRepository::new(dir.path());
        repo.validate_availability().await.unwrap();
        assert!(repo.load().await.unwrap().is_none());

        repo.commit(&record()).await.unwrap();

        // A fresh handle must read the same record with the persisted key
        let reopened = FileShareRepository::new(dir.path());
        let loaded = reopened.load().await.unwrap().unwrap();
        assert_eq!(loaded.shares(), record().shares());
        assert_eq!(loaded.state(), WalletState::Active);
        assert_eq!(loaded.address(), Some("addr"));

        let raw = std::fs::read(repo.record_path()).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("c0ffee"));
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let dir = tempdir().unwrap();
        let repo = FileShareRepository::new(dir.path());
        repo.commit(&record()).await.unwrap();

        let mut raw = std::fs::read(repo.record_path()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(repo.record_path(), raw).unwrap();

        assert!(matches!(repo.load().await, Err(RepositoryError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let repo = FileShareRepository::new(dir.path());
        repo.commit(&record()).await.unwrap();
        repo.commit(&record()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }
}
