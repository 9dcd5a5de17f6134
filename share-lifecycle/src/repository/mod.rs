//! Local persistent store for the wallet this device holds.
//!
//! The repository is the single source of truth for the current signing
//! shares and address. It does not serialize writers itself; the
//! orchestrator's mutation guard guarantees a single writer.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::models::{Curve, ShareMaterial, WalletRecord};

mod file;

pub use file::FileShareRepository;

/// Error types that can occur in a share repository
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored wallet record is corrupt: {0}")]
    Corrupt(String),

    #[error("Share repository unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Secure local store for the wallet record.
///
/// "Not found" is `Ok(None)`; only real failures are errors.
#[async_trait]
pub trait ShareRepository: Send + Sync {
    async fn validate_availability(&self) -> Result<(), RepositoryError>;

    /// Loads the whole record
    async fn load(&self) -> Result<Option<WalletRecord>, RepositoryError>;

    /// Replaces the whole record in one write
    async fn commit(&self, record: &WalletRecord) -> Result<(), RepositoryError>;

    async fn get(&self, curve: Curve) -> Result<Option<ShareMaterial>, RepositoryError> {
        Ok(self.load().await?.and_then(|r| r.share(curve).cloned()))
    }

    async fn set(&self, curve: Curve, share: ShareMaterial) -> Result<(), RepositoryError> {
        let mut record = self.load().await?.unwrap_or_default();
        record.set_share(curve, share);
        self.commit(&record).await
    }

    async fn get_address(&self) -> Result<Option<String>, RepositoryError> {
        Ok(self.load().await?.and_then(|r| r.address().map(str::to_string)))
    }

    async fn set_address(&self, address: String) -> Result<(), RepositoryError> {
        let mut record = self.load().await?.unwrap_or_default();
        record.set_address(address);
        self.commit(&record).await
    }
}

/// Repository held in memory; lost when dropped
#[derive(Default)]
pub struct MemoryShareRepository {
    record: Mutex<Option<WalletRecord>>,
}

impl MemoryShareRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareRepository for MemoryShareRepository {
    async fn validate_availability(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<WalletRecord>, RepositoryError> {
        Ok(self.record.lock().await.clone())
    }

    async fn commit(&self, record: &WalletRecord) -> Result<(), RepositoryError> {
        *self.record.lock().await = Some(record.clone());
        Ok(())
    }
}
