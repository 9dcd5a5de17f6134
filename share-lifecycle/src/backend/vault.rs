use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::{
    BackendError, EncryptedStorageBackend, KeyMaterial, SealedBackup, decrypt_with_stored_key,
    seal_with_fresh_key,
};
use crate::models::{BackendId, BackupBlob};

/// Remote key-value store holding backup keys.
///
/// Cloud key-value storage and the custodian both sit behind this trait; only
/// the slot namespace differs.
#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn ping(&self) -> Result<(), String>;

    async fn put(&self, slot: &str, value: &[u8]) -> Result<(), String>;

    /// `Ok(None)` when nothing is stored under `slot`
    async fn get(&self, slot: &str) -> Result<Option<Zeroizing<Vec<u8>>>, String>;
}

/// In-process [`KeyVault`]
#[derive(Default)]
pub struct MemoryKeyVault {
    slots: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    offline: AtomicBool,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the vault could not be reached
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_online(&self) -> Result<(), String> {
        if self.offline.load(Ordering::SeqCst) {
            Err("vault unreachable".to_string())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyVault for MemoryKeyVault {
    async fn ping(&self) -> Result<(), String> {
        self.check_online()
    }

    async fn put(&self, slot: &str, value: &[u8]) -> Result<(), String> {
        self.check_online()?;
        self.slots
            .lock()
            .await
            .insert(slot.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    async fn get(&self, slot: &str) -> Result<Option<Zeroizing<Vec<u8>>>, String> {
        self.check_online()?;
        Ok(self.slots.lock().await.get(slot).cloned())
    }
}

/// Backend storing backup keys in a [`KeyVault`] under a fixed prefix
pub struct VaultBackend {
    id: BackendId,
    prefix: &'static str,
    vault: Arc<dyn KeyVault>,
}

impl VaultBackend {
    /// Cloud key-value backend, slots under `backup/`
    pub fn cloud(vault: Arc<dyn KeyVault>) -> Self {
        Self {
            id: BackendId::CloudKeyValue,
            prefix: "backup/",
            vault,
        }
    }

    /// Custodian backend, slots under `custodian/`
    pub fn custodian(vault: Arc<dyn KeyVault>) -> Self {
        Self {
            id: BackendId::Custodian,
            prefix: "custodian/",
            vault,
        }
    }

    fn slot(&self, storage_key: &str) -> String {
        format!("{}{}", self.prefix, storage_key)
    }
}

#[async_trait]
impl EncryptedStorageBackend for VaultBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    async fn validate_availability(&self) -> Result<(), BackendError> {
        self.vault.ping().await.map_err(BackendError::Unavailable)
    }

    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError> {
        seal_with_fresh_key(self.id, payload)
    }

    async fn write(&self, sealed: &SealedBackup) -> Result<(), BackendError> {
        let KeyMaterial::Key(key) = &sealed.key else {
            return Err(BackendError::Write(format!("{} backend stores raw keys only", self.id)));
        };
        self.vault
            .put(&self.slot(&sealed.blob.storage_key), key)
            .await
            .map_err(BackendError::Write)
    }

    async fn read(&self, storage_key: &str) -> Result<KeyMaterial, BackendError> {
        match self.vault.get(&self.slot(storage_key)).await {
            Ok(Some(key)) => Ok(KeyMaterial::Key(key)),
            Ok(None) => Err(BackendError::KeyNotFound(storage_key.to_string())),
            Err(e) => Err(BackendError::Read(e)),
        }
    }

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
        decrypt_with_stored_key(blob, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cloud_and_custodian_use_separate_namespaces() {
        let vault = Arc::new(MemoryKeyVault::new());
        let cloud = VaultBackend::cloud(vault.clone());
        let custodian = VaultBackend::custodian(vault.clone());

        let sealed = cloud.encrypt(b"cloud payload").await.unwrap();
        cloud.write(&sealed).await.unwrap();
        assert_eq!(vault.len().await, 1);

        let key = cloud.read(&sealed.blob.storage_key).await.unwrap();
        assert_eq!(cloud.decrypt(&sealed.blob, &key).await.unwrap(), b"cloud payload");

        assert!(matches!(
            custodian.read(&sealed.blob.storage_key).await,
            Err(BackendError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_vault() {
        let vault = Arc::new(MemoryKeyVault::new());
        let backend = VaultBackend::cloud(vault.clone());
        let sealed = backend.encrypt(b"x").await.unwrap();

        vault.set_offline(true);
        assert!(matches!(
            backend.validate_availability().await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(backend.write(&sealed).await, Err(BackendError::Write(_))));
        assert!(vault.is_empty().await);
    }
}
