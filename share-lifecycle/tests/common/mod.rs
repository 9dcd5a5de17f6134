#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use share_lifecycle::backend::{
    BackendError, EncryptedStorageBackend, KeyMaterial, KeySource, MemoryKeyVault, SealedBackup,
    VaultBackend,
};
use share_lifecycle::engine::{
    DealerEngine, EngineContext, EngineError, MintedShare, Notification, RemoteShareEngine, codes,
};
use share_lifecycle::repository::{MemoryShareRepository, RepositoryError, ShareRepository};
use share_lifecycle::{
    BackendId, BackendSet, BackupBlob, Curve, LifecycleConfig, PrivateKey, ShareLifecycle,
    ShareMaterial, WalletRecord,
};

pub const PASSWORD: &str = "correct horse battery staple";

/// Dealer engine with call counters and switchable failures
pub struct ScriptedEngine {
    pub dealer: DealerEngine,
    pub generate_calls: AtomicUsize,
    pub backup_calls: AtomicUsize,
    pub recover_signing_calls: AtomicUsize,
    pub recover_backup_calls: AtomicUsize,
    pub notify_calls: AtomicUsize,
    pub eject_calls: AtomicUsize,

    pub fail_generate: Mutex<HashSet<Curve>>,
    pub fail_notify: AtomicBool,
    pub fail_recover_backup: AtomicBool,

    /// Return ed25519 keys as `scalar || public key`-sized blobs, the way
    /// keypair-oriented engines encode them
    pub keypair_ed25519_keys: AtomicBool,

    /// When set, generate waits for `release` after signalling `entered`
    pub gate_generate: AtomicBool,
    pub entered: Notify,
    pub release: Semaphore,

    /// Last backup share pair id handed out per curve
    pub backup_pairs: Mutex<BTreeMap<Curve, String>>,
    pub notifications: Mutex<Vec<Notification>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dealer: DealerEngine::new(),
            generate_calls: AtomicUsize::new(0),
            backup_calls: AtomicUsize::new(0),
            recover_signing_calls: AtomicUsize::new(0),
            recover_backup_calls: AtomicUsize::new(0),
            notify_calls: AtomicUsize::new(0),
            eject_calls: AtomicUsize::new(0),
            fail_generate: Mutex::new(HashSet::new()),
            fail_notify: AtomicBool::new(false),
            fail_recover_backup: AtomicBool::new(false),
            keypair_ed25519_keys: AtomicBool::new(false),
            gate_generate: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
            backup_pairs: Mutex::new(BTreeMap::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn total_calls(&self) -> usize {
        [
            &self.generate_calls,
            &self.backup_calls,
            &self.recover_signing_calls,
            &self.recover_backup_calls,
            &self.notify_calls,
            &self.eject_calls,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn fail_generate_for(&self, curve: Curve) {
        self.fail_generate.lock().unwrap().insert(curve);
    }

    pub fn set_fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }

    /// Custodian halves for the most recent backup of every curve
    pub fn custodian_shares(&self) -> BTreeMap<Curve, String> {
        self.backup_pairs
            .lock()
            .unwrap()
            .iter()
            .map(|(&curve, pair)| (curve, self.dealer.custodian_share(pair).unwrap()))
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    fn remember_backup(&self, share: &ShareMaterial) {
        self.backup_pairs
            .lock()
            .unwrap()
            .insert(share.curve, share.share_pair_id.clone());
    }
}

#[async_trait]
impl RemoteShareEngine for ScriptedEngine {
    async fn generate(&self, ctx: &EngineContext, curve: Curve) -> Result<MintedShare, EngineError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_generate.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
        }
        if self.fail_generate.lock().unwrap().contains(&curve) {
            return Err(EngineError::remote(codes::INTERNAL, "keygen failed"));
        }
        self.dealer.generate(ctx, curve).await
    }

    async fn backup(&self, ctx: &EngineContext, signing_share: &ShareMaterial) -> Result<ShareMaterial, EngineError> {
        self.backup_calls.fetch_add(1, Ordering::SeqCst);
        let share = self.dealer.backup(ctx, signing_share).await?;
        self.remember_backup(&share);
        Ok(share)
    }

    async fn recover_signing(&self, ctx: &EngineContext, backup_share: &ShareMaterial) -> Result<MintedShare, EngineError> {
        self.recover_signing_calls.fetch_add(1, Ordering::SeqCst);
        self.dealer.recover_signing(ctx, backup_share).await
    }

    async fn recover_backup(&self, ctx: &EngineContext, backup_share: &ShareMaterial) -> Result<ShareMaterial, EngineError> {
        self.recover_backup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_recover_backup.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection reset".to_string()));
        }
        let share = self.dealer.recover_backup(ctx, backup_share).await?;
        self.remember_backup(&share);
        Ok(share)
    }

    async fn notify(&self, ctx: &EngineContext, notification: &Notification) -> Result<(), EngineError> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("engine unreachable".to_string()));
        }
        self.dealer.notify(ctx, notification).await?;
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn eject(&self, client_backup_share: &ShareMaterial, custodian_backup_share: &str) -> Result<PrivateKey, EngineError> {
        self.eject_calls.fetch_add(1, Ordering::SeqCst);
        let key = self.dealer.eject(client_backup_share, custodian_backup_share).await?;
        if client_backup_share.curve == Curve::Ed25519 && self.keypair_ed25519_keys.load(Ordering::SeqCst) {
            return Ok(PrivateKey::new(format!("{}{}", key.expose(), "00".repeat(32))));
        }
        Ok(key)
    }
}

/// Wraps a backend, counting calls and optionally failing writes
pub struct CountingBackend {
    inner: Arc<dyn EncryptedStorageBackend>,
    pub encrypt_calls: AtomicUsize,
    pub write_calls: AtomicUsize,
    pub fail_write: AtomicBool,
}

impl CountingBackend {
    pub fn new(inner: Arc<dyn EncryptedStorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            encrypt_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            fail_write: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst) + self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EncryptedStorageBackend for CountingBackend {
    fn id(&self) -> BackendId {
        self.inner.id()
    }

    fn key_source(&self) -> KeySource {
        self.inner.key_source()
    }

    async fn validate_availability(&self) -> Result<(), BackendError> {
        self.inner.validate_availability().await
    }

    async fn encrypt(&self, payload: &[u8]) -> Result<SealedBackup, BackendError> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encrypt(payload).await
    }

    async fn encrypt_under(&self, payload: &[u8], key: &KeyMaterial) -> Result<SealedBackup, BackendError> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encrypt_under(payload, key).await
    }

    async fn write(&self, sealed: &SealedBackup) -> Result<(), BackendError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(BackendError::Write("quota exceeded".to_string()));
        }
        self.inner.write(sealed).await
    }

    async fn read(&self, storage_key: &str) -> Result<KeyMaterial, BackendError> {
        self.inner.read(storage_key).await
    }

    async fn decrypt(&self, blob: &BackupBlob, key: &KeyMaterial) -> Result<Vec<u8>, BackendError> {
        self.inner.decrypt(blob, key).await
    }
}

/// In-memory repository that can be made unavailable or refuse commits
#[derive(Default)]
pub struct FlakyRepository {
    inner: MemoryShareRepository,
    pub unavailable: AtomicBool,
    pub fail_commit: AtomicBool,
}

impl FlakyRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ShareRepository for FlakyRepository {
    async fn validate_availability(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("keychain locked".to_string()));
        }
        self.inner.validate_availability().await
    }

    async fn load(&self) -> Result<Option<WalletRecord>, RepositoryError> {
        self.inner.load().await
    }

    async fn commit(&self, record: &WalletRecord) -> Result<(), RepositoryError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(RepositoryError::Io(std::io::Error::other("disk full")));
        }
        self.inner.commit(record).await
    }
}

pub fn config() -> LifecycleConfig {
    LifecycleConfig {
        password: Some(PASSWORD.to_string()),
        ..LifecycleConfig::default()
    }
}

/// Everything a test needs to drive one device
pub struct Device {
    pub lifecycle: Arc<ShareLifecycle>,
    pub engine: Arc<ScriptedEngine>,
    pub repository: Arc<FlakyRepository>,
    pub cloud: Arc<CountingBackend>,
    pub vault: Arc<MemoryKeyVault>,
}

impl Device {
    pub fn new(engine: Arc<ScriptedEngine>, config: LifecycleConfig) -> Self {
        Self::with_vault(engine, config, Arc::new(MemoryKeyVault::new()))
    }

    /// A device whose cloud and custodian backends share `vault` with others
    pub fn with_vault(engine: Arc<ScriptedEngine>, config: LifecycleConfig, vault: Arc<MemoryKeyVault>) -> Self {
        let cloud = CountingBackend::new(Arc::new(VaultBackend::cloud(vault.clone())));
        let backends = BackendSet::from_config(&config, &std::env::temp_dir())
            .with(cloud.clone())
            .with(Arc::new(VaultBackend::custodian(vault.clone())));
        let repository = FlakyRepository::new();
        let lifecycle = ShareLifecycle::new(config, engine.clone(), backends, repository.clone()).unwrap();
        Self {
            lifecycle: Arc::new(lifecycle),
            engine,
            repository,
            cloud,
            vault,
        }
    }
}
