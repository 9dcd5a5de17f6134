//! Error taxonomy for lifecycle operations.
//!
//! Every public operation returns exactly one [`LifecycleError`] on failure.
//! Component errors from the engine, storage backends and the repository are
//! converted into it without being downgraded.

use crate::backend::BackendError;
use crate::engine::{EngineError, Notification};
use crate::guard::Operation;
use crate::models::{BackendId, Curve, EjectedKeys};
use crate::repository::RepositoryError;

/// Error types that can occur during lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Protocol version {configured} is no longer supported (this build requires {supported})")]
    ProtocolVersionUnsupported { configured: String, supported: String },

    #[error("Wallet modification already in progress ({in_flight})")]
    ConcurrentMutationRejected { in_flight: Operation },

    #[error("Storage backend {backend} is unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    #[error("No password provided for the password backend")]
    PasswordMissing,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Failed to write to storage backend {backend}: {reason}")]
    StorageWriteFailed { backend: BackendId, reason: String },

    #[error("Failed to read from storage backend {backend}: {reason}")]
    StorageReadFailed { backend: BackendId, reason: String },

    /// Durable state was written but notifying the engine failed. Retry only
    /// the notifications in `pending` with
    /// [`ShareLifecycle::retry_notifications`](crate::lifecycle::ShareLifecycle::retry_notifications).
    #[error("Shares were stored but the engine was not notified: {source}")]
    PartialSuccessStaleBookkeeping {
        pending: Vec<Notification>,
        #[source]
        source: EngineError,
    },

    /// Recovery replaced the signing share but refreshing the backup failed.
    /// The wallet is usable but has no current backup; run a fresh backup.
    #[error("Signing share for {address} was replaced but the backup refresh failed; a new backup is required: {source}")]
    SigningReplacedButBackupStale {
        address: String,
        #[source]
        source: Box<LifecycleError>,
    },

    /// The private keys were reconstructed and the wallet is ejected locally,
    /// but the engine was not told. Never retried automatically.
    #[error("Private key extracted but the ejection was not recorded remotely: {source}")]
    EjectionNotRecorded {
        keys: EjectedKeys,
        pending: Vec<Notification>,
        #[source]
        source: EngineError,
    },

    /// The engine combined the private keys but the device could not record
    /// the ejection. The engine was not told; the wallet is unchanged locally.
    #[error("Private key extracted but the ejection could not be saved on this device: {source}")]
    EjectionNotPersisted {
        keys: EjectedKeys,
        #[source]
        source: RepositoryError,
    },

    #[error("A wallet already exists on this device")]
    WalletAlreadyExists,

    #[error("No wallet found on this device")]
    NoWallet,

    #[error("Wallet has been ejected; no further share operations are possible")]
    WalletEjected,

    #[error("Address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: String, actual: String },

    #[error("Malformed {curve} share: {reason}")]
    MalformedShare { curve: Curve, reason: String },

    #[error("No custodian backup share provided for {0}")]
    MissingCustodianShare(Curve),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LifecycleError {
    /// Maps a backend failure to the lifecycle error for the backend that
    /// raised it.
    pub(crate) fn from_backend(backend: BackendId, err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(reason) => LifecycleError::BackendUnavailable { backend, reason },
            BackendError::PasswordMissing => LifecycleError::PasswordMissing,
            BackendError::Encryption(reason) => LifecycleError::EncryptionFailed(reason),
            BackendError::Decryption(reason) => LifecycleError::DecryptionFailed(reason),
            BackendError::Write(reason) => LifecycleError::StorageWriteFailed { backend, reason },
            BackendError::Read(reason) => LifecycleError::StorageReadFailed { backend, reason },
            BackendError::KeyNotFound(key) => LifecycleError::StorageReadFailed {
                backend,
                reason: format!("no key stored under {}", key),
            },
        }
    }

    /// True for the two partial-success kinds that need their own remediation
    pub fn is_partial_success(&self) -> bool {
        matches!(
            self,
            LifecycleError::PartialSuccessStaleBookkeeping { .. }
                | LifecycleError::SigningReplacedButBackupStale { .. }
                | LifecycleError::EjectionNotRecorded { .. }
                | LifecycleError::EjectionNotPersisted { .. }
        )
    }

    /// Private keys carried by an ejection that only partly completed
    pub fn ejected_keys(&self) -> Option<&EjectedKeys> {
        match self {
            LifecycleError::EjectionNotRecorded { keys, .. }
            | LifecycleError::EjectionNotPersisted { keys, .. } => Some(keys),
            _ => None,
        }
    }

    /// Notifications left undelivered by a partial success
    pub fn pending_notifications(&self) -> Option<&[Notification]> {
        match self {
            LifecycleError::PartialSuccessStaleBookkeeping { pending, .. }
            | LifecycleError::EjectionNotRecorded { pending, .. } => Some(pending),
            _ => None,
        }
    }

    /// Code and message of a remote engine rejection, if this is one
    pub fn remote_code(&self) -> Option<(i64, &str)> {
        match self {
            LifecycleError::Engine(EngineError::Remote { code, message }) => {
                Some((*code, message.as_str()))
            }
            _ => None,
        }
    }
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
