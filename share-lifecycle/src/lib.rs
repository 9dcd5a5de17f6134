//! Lifecycle of threshold wallet key shares on a client device.
//!
//! A wallet is generated by a remote share engine, backed up through one of
//! several encrypted storage backends, recovered from such a backup, and
//! finally ejected into a plain private key. [`ShareLifecycle`] runs these
//! operations one at a time against a [`ShareRepository`].

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod models;
pub mod progress;
pub mod repository;
mod secure_fs;

// Re-export commonly used types
pub use backend::{BackendError, BackendSet, EncryptedStorageBackend, KeySource};
pub use config::{LifecycleConfig, ProtocolCapabilities, SUPPORTED_PROTOCOL_VERSION};
pub use engine::{EngineContext, EngineError, Notification, RemoteShareEngine};
pub use error::{LifecycleError, Result};
pub use guard::{MutationGuard, Operation};
pub use lifecycle::{Recovered, ShareLifecycle};
pub use models::{
    BackendId, BackupBlob, Curve, EjectedKeys, PrivateKey, ShareMaterial, WalletRecord, WalletState,
};
pub use progress::{ProgressReporter, ProgressStatus};
pub use repository::{FileShareRepository, MemoryShareRepository, RepositoryError, ShareRepository};
