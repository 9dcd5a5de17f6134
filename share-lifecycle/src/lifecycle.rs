//! Share lifecycle orchestrator.
//!
//! [`ShareLifecycle`] sequences engine calls, backend I/O and repository
//! commits for generate, backup, recover and eject. Each mutating operation
//! follows the same shape:
//!
//! 1. reject an unsupported protocol version before touching anything
//! 2. take the single-flight [`MutationGuard`] (released on every exit)
//! 3. call the engine once per curve, concurrently, and join every call
//! 4. validate, encrypt and write where the operation needs it
//! 5. commit the wallet record in one write
//! 6. notify the engine that the new state is durable
//!
//! A failure before step 5 leaves the device unchanged. A failure in step 6
//! surfaces as a partial-success error carrying what is left to do.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backend::{BackendSet, EncryptedStorageBackend, KeyMaterial, KeySource};
use crate::config::{LifecycleConfig, SUPPORTED_PROTOCOL_VERSION};
use crate::engine::{EngineContext, EngineError, MintedShare, Notification, RemoteShareEngine};
use crate::error::{LifecycleError, Result};
use crate::guard::{MutationGuard, MutationPermit, Operation};
use crate::models::{
    BackendId, BackupBlob, BackupPayload, Curve, EjectedKeys, ShareMaterial, WalletRecord,
};
use crate::progress::{NoopReporter, ProgressReporter, ProgressStatus};
use crate::repository::ShareRepository;

/// Result of a successful recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    /// Primary address of the recovered wallet
    pub address: String,

    /// Replacement backup when the backup share was refreshed. The blob that
    /// was recovered from must not be relied on afterwards.
    pub refreshed_backup: Option<BackupBlob>,
}

/// Coordinates the engine, storage backends and the share repository
pub struct ShareLifecycle {
    engine: Arc<dyn RemoteShareEngine>,
    backends: BackendSet,
    repository: Arc<dyn ShareRepository>,
    reporter: Arc<dyn ProgressReporter>,
    guard: Arc<MutationGuard>,
    config: LifecycleConfig,
    ctx: EngineContext,
}

impl ShareLifecycle {
    pub fn new(
        config: LifecycleConfig,
        engine: Arc<dyn RemoteShareEngine>,
        backends: BackendSet,
        repository: Arc<dyn ShareRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = EngineContext::from(&config);
        Ok(Self {
            engine,
            backends,
            repository,
            reporter: Arc::new(NoopReporter),
            guard: Arc::new(MutationGuard::new()),
            config,
            ctx,
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Shares a guard with other orchestrators over the same wallet
    pub fn with_guard(mut self, guard: Arc<MutationGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn guard(&self) -> Arc<MutationGuard> {
        self.guard.clone()
    }

    /// True while a mutating operation is in flight
    pub fn is_mutating(&self) -> bool {
        self.guard.is_held()
    }

    /// The wallet currently held by this device; empty when there is none
    pub async fn status(&self) -> Result<WalletRecord> {
        Ok(self.repository.load().await?.unwrap_or_default())
    }

    /// Creates a new wallet with one signing share per configured curve and
    /// returns its primary address.
    pub async fn generate(&self) -> Result<String> {
        self.check_protocol()?;
        let _permit = self.acquire(Operation::Generate)?;

        self.repository.validate_availability().await?;
        let mut record = self.repository.load().await?.unwrap_or_default();
        if record.is_ejected() {
            return Err(LifecycleError::WalletEjected);
        }
        if !record.is_empty() {
            return Err(LifecycleError::WalletAlreadyExists);
        }

        let curves = self.config.active_curves();
        info!(?curves, "generating wallet");
        self.progress(ProgressStatus::GeneratingShare);
        let minted = join_per_curve(
            curves
                .iter()
                .map(|&curve| (curve, self.engine.generate(&self.ctx, curve)))
                .collect(),
        )
        .await?;

        self.progress(ProgressStatus::ParsingShare);
        let (address, shares) = split_minted(minted)?;

        self.progress(ProgressStatus::StoringShare);
        record.activate(address.clone(), shares);
        self.repository.commit(&record).await?;

        self.notify_all(signing_stored(&record)).await?;
        self.progress(ProgressStatus::Done);
        info!(%address, "wallet generated");
        Ok(address)
    }

    /// Backs up the current signing shares through `method` and returns the
    /// encrypted blob. The blob's key material is written before the engine
    /// is told the backup exists.
    pub async fn backup(&self, method: BackendId) -> Result<BackupBlob> {
        self.check_protocol()?;
        let _permit = self.acquire(Operation::Backup)?;

        self.progress(ProgressStatus::ReadingShare);
        let mut record = self.repository.load().await?.ok_or(LifecycleError::NoWallet)?;
        if record.is_ejected() {
            return Err(LifecycleError::WalletEjected);
        }
        if record.is_empty() {
            return Err(LifecycleError::NoWallet);
        }
        let address = record.address().ok_or(LifecycleError::NoWallet)?.to_string();

        let backend = self.backend(method)?;
        backend
            .validate_availability()
            .await
            .map_err(|e| LifecycleError::from_backend(method, e))?;

        info!(%method, curves = ?record.curves(), "backing up wallet");
        self.progress(ProgressStatus::GeneratingShare);
        let backup_shares = join_per_curve(
            record
                .shares()
                .iter()
                .map(|(&curve, share)| (curve, self.engine.backup(&self.ctx, share)))
                .collect(),
        )
        .await?;

        self.progress(ProgressStatus::ParsingShare);
        for (&curve, share) in &backup_shares {
            parse_share(curve, share)?;
        }

        let payload = BackupPayload {
            address,
            shares: backup_shares,
        };
        let blob = self.seal_and_store(backend.as_ref(), &payload, None).await?;

        record.mark_backed_up(method);
        self.repository.commit(&record).await?;

        self.notify_all(backup_stored(&payload)).await?;
        self.progress(ProgressStatus::Done);
        info!(%method, storage_key = %blob.storage_key, "backup stored");
        Ok(blob)
    }

    /// Restores signing shares from a backup.
    ///
    /// `credential` is the password for password backups and ignored
    /// otherwise. On a device that already holds a wallet the recovered
    /// address must match it.
    pub async fn recover(&self, blob: &BackupBlob, credential: Option<&str>) -> Result<Recovered> {
        self.check_protocol()?;
        let _permit = self.acquire(Operation::Recover)?;

        self.repository.validate_availability().await?;
        let mut record = self.repository.load().await?.unwrap_or_default();
        if record.is_ejected() {
            return Err(LifecycleError::WalletEjected);
        }

        let backend = self.backend(blob.backend_id)?;
        let (payload, key) = self.open_backup(backend.as_ref(), blob, credential).await?;
        if let Some(local) = record.address() {
            if local != payload.address {
                return Err(LifecycleError::AddressMismatch {
                    expected: local.to_string(),
                    actual: payload.address,
                });
            }
        }

        let active = self.config.active_curves();
        let backup_shares: BTreeMap<Curve, ShareMaterial> = payload
            .shares
            .iter()
            .filter(|(curve, _)| active.contains(curve))
            .map(|(&curve, share)| (curve, share.clone()))
            .collect();
        if backup_shares.is_empty() {
            return Err(LifecycleError::Config(
                "backup holds no share for the configured curves".to_string(),
            ));
        }

        info!(backend = %blob.backend_id, curves = ?backup_shares.keys().collect::<Vec<_>>(), "recovering wallet");
        self.progress(ProgressStatus::RecoveringSigningShare);
        let minted = join_per_curve(
            backup_shares
                .iter()
                .map(|(&curve, share)| (curve, self.engine.recover_signing(&self.ctx, share)))
                .collect(),
        )
        .await?;

        self.progress(ProgressStatus::ParsingShare);
        let (address, signing_shares) = split_minted(minted)?;
        if address != payload.address {
            return Err(LifecycleError::AddressMismatch {
                expected: payload.address,
                actual: address,
            });
        }

        self.progress(ProgressStatus::StoringShare);
        record.replace_signing_shares(address.clone(), signing_shares);
        self.repository.commit(&record).await?;
        self.notify_all(signing_stored(&record)).await?;

        let refreshed_backup = if self.config.capabilities.refresh_backup_on_recover {
            match self
                .refresh_backup(backend.as_ref(), &key, &address, &backup_shares, &mut record)
                .await
            {
                Ok(blob) => Some(blob),
                Err(source) => {
                    warn!(%address, error = %source, "backup refresh failed after recovery");
                    return Err(LifecycleError::SigningReplacedButBackupStale {
                        address,
                        source: Box::new(source),
                    });
                }
            }
        } else {
            None
        };

        self.progress(ProgressStatus::Done);
        info!(%address, refreshed = refreshed_backup.is_some(), "wallet recovered");
        Ok(Recovered {
            address,
            refreshed_backup,
        })
    }

    /// Combines the client backup shares with the custodian's halves and
    /// returns the private key of every curve. The wallet is ejected for
    /// good: signing shares are discarded and every later mutating call
    /// fails with [`LifecycleError::WalletEjected`].
    pub async fn eject(
        &self,
        blob: &BackupBlob,
        credential: Option<&str>,
        custodian_shares: &BTreeMap<Curve, String>,
    ) -> Result<EjectedKeys> {
        self.check_protocol()?;
        let _permit = self.acquire(Operation::Eject)?;

        self.repository.validate_availability().await?;
        let mut record = self.repository.load().await?.unwrap_or_default();
        if record.is_ejected() {
            return Err(LifecycleError::WalletEjected);
        }

        let backend = self.backend(blob.backend_id)?;
        let (payload, _) = self.open_backup(backend.as_ref(), blob, credential).await?;
        if let Some(local) = record.address() {
            if local != payload.address {
                return Err(LifecycleError::AddressMismatch {
                    expected: local.to_string(),
                    actual: payload.address,
                });
            }
        }

        let mut calls = Vec::with_capacity(payload.shares.len());
        for (&curve, share) in &payload.shares {
            let custodian = custodian_shares
                .get(&curve)
                .ok_or(LifecycleError::MissingCustodianShare(curve))?;
            calls.push((curve, self.engine.eject(share, custodian)));
        }

        info!(address = %payload.address, "ejecting wallet");
        let keys = join_per_curve(calls).await?;

        // Key encoding belongs to the engine; keys are handed back as returned
        let notifications: Vec<Notification> = payload
            .shares
            .iter()
            .map(|(&curve, share)| Notification::Ejected {
                curve,
                share_pair_id: share.share_pair_id.clone(),
            })
            .collect();

        self.progress(ProgressStatus::StoringShare);
        if record.address().is_none() {
            record.set_address(payload.address.clone());
        }
        record.mark_ejected();
        if let Err(source) = self.repository.commit(&record).await {
            warn!(error = %source, "ejection not persisted on this device");
            return Err(LifecycleError::EjectionNotPersisted { keys, source });
        }

        if let Err((pending, source)) = self.send_notifications(notifications).await {
            warn!(error = %source, "ejection not recorded by engine");
            return Err(LifecycleError::EjectionNotRecorded {
                keys,
                pending,
                source,
            });
        }

        self.progress(ProgressStatus::Done);
        info!(address = %payload.address, "wallet ejected");
        Ok(keys)
    }

    /// Re-sends the notifications left pending by a partial success. Nothing
    /// else is redone.
    pub async fn retry_notifications(&self, pending: &[Notification]) -> Result<()> {
        self.check_protocol()?;
        let _permit = self.acquire(Operation::Notify)?;
        self.notify_all(pending.to_vec()).await
    }

    fn check_protocol(&self) -> Result<()> {
        if self.config.supports_protocol() {
            Ok(())
        } else {
            Err(LifecycleError::ProtocolVersionUnsupported {
                configured: self.config.protocol_version.clone(),
                supported: SUPPORTED_PROTOCOL_VERSION.to_string(),
            })
        }
    }

    fn acquire(&self, operation: Operation) -> Result<MutationPermit<'_>> {
        self.guard.try_acquire(operation).map_err(|in_flight| {
            debug!(%operation, %in_flight, "mutation rejected");
            LifecycleError::ConcurrentMutationRejected { in_flight }
        })
    }

    fn progress(&self, status: ProgressStatus) {
        debug!(status = status.display_status(), "progress");
        self.reporter.report(status);
    }

    fn backend(&self, id: BackendId) -> Result<Arc<dyn EncryptedStorageBackend>> {
        self.backends.get(id).ok_or_else(|| LifecycleError::BackendUnavailable {
            backend: id,
            reason: "backend not configured".to_string(),
        })
    }

    /// Obtains the key for `blob`, decrypts it and parses the payload.
    /// Returns the key material alongside so a refresh can reseal under it.
    async fn open_backup(
        &self,
        backend: &dyn EncryptedStorageBackend,
        blob: &BackupBlob,
        credential: Option<&str>,
    ) -> Result<(BackupPayload, KeyMaterial)> {
        let id = blob.backend_id;
        self.progress(ProgressStatus::ReadingShare);
        let key = match backend.key_source() {
            KeySource::Password => {
                let password = credential
                    .filter(|p| !p.is_empty())
                    .or(self.config.password.as_deref().filter(|p| !p.is_empty()))
                    .ok_or(LifecycleError::PasswordMissing)?;
                KeyMaterial::Password(Zeroizing::new(password.to_string()))
            }
            KeySource::Stored => {
                backend
                    .validate_availability()
                    .await
                    .map_err(|e| LifecycleError::from_backend(id, e))?;
                backend
                    .read(&blob.storage_key)
                    .await
                    .map_err(|e| LifecycleError::from_backend(id, e))?
            }
        };

        self.progress(ProgressStatus::DecryptingShare);
        let plain = Zeroizing::new(
            backend
                .decrypt(blob, &key)
                .await
                .map_err(|e| LifecycleError::from_backend(id, e))?,
        );

        self.progress(ProgressStatus::ParsingShare);
        let payload: BackupPayload = serde_json::from_slice(&plain)
            .map_err(|e| LifecycleError::DecryptionFailed(format!("backup payload is malformed: {}", e)))?;
        if payload.shares.is_empty() {
            return Err(LifecycleError::DecryptionFailed("backup holds no shares".to_string()));
        }
        for (&curve, share) in &payload.shares {
            parse_share(curve, share)?;
        }
        Ok((payload, key))
    }

    /// Encrypts a payload and writes its key material to the backend.
    /// `reuse` seals under the key material of the backup being replaced.
    async fn seal_and_store(
        &self,
        backend: &dyn EncryptedStorageBackend,
        payload: &BackupPayload,
        reuse: Option<&KeyMaterial>,
    ) -> Result<BackupBlob> {
        let id = backend.id();
        self.progress(ProgressStatus::EncryptingShare);
        let plain = Zeroizing::new(
            serde_json::to_vec(payload).map_err(|e| LifecycleError::EncryptionFailed(e.to_string()))?,
        );
        let sealed = match reuse {
            Some(key) => backend.encrypt_under(&plain, key).await,
            None => backend.encrypt(&plain).await,
        }
        .map_err(|e| LifecycleError::from_backend(id, e))?;

        self.progress(ProgressStatus::StoringShare);
        if backend.key_source() == KeySource::Stored {
            backend
                .write(&sealed)
                .await
                .map_err(|e| LifecycleError::from_backend(id, e))?;
        }
        Ok(sealed.blob)
    }

    /// Second phase of recovery: mint fresh backup shares and store them.
    /// The record is only marked backed up once the engine acknowledged the
    /// new backup, so any error here leaves it without a current backup.
    async fn refresh_backup(
        &self,
        backend: &dyn EncryptedStorageBackend,
        key: &KeyMaterial,
        address: &str,
        backup_shares: &BTreeMap<Curve, ShareMaterial>,
        record: &mut WalletRecord,
    ) -> Result<BackupBlob> {
        self.progress(ProgressStatus::RecoveringBackupShare);
        let fresh = join_per_curve(
            backup_shares
                .iter()
                .map(|(&curve, share)| (curve, self.engine.recover_backup(&self.ctx, share)))
                .collect(),
        )
        .await?;
        for (&curve, share) in &fresh {
            parse_share(curve, share)?;
        }

        let payload = BackupPayload {
            address: address.to_string(),
            shares: fresh,
        };
        let blob = self.seal_and_store(backend, &payload, Some(key)).await?;

        if let Err((_, source)) = self.send_notifications(backup_stored(&payload)).await {
            return Err(source.into());
        }

        record.mark_backed_up(backend.id());
        self.repository.commit(record).await?;
        Ok(blob)
    }

    /// Sends notifications, mapping any failure to a stale bookkeeping error
    async fn notify_all(&self, notifications: Vec<Notification>) -> Result<()> {
        self.send_notifications(notifications)
            .await
            .map_err(|(pending, source)| {
                warn!(pending = pending.len(), error = %source, "engine notification failed");
                LifecycleError::PartialSuccessStaleBookkeeping { pending, source }
            })
    }

    /// Sends every notification concurrently. On failure returns the ones
    /// that were not delivered and the first error.
    async fn send_notifications(
        &self,
        notifications: Vec<Notification>,
    ) -> std::result::Result<(), (Vec<Notification>, EngineError)> {
        let results = join_all(
            notifications
                .iter()
                .map(|notification| self.engine.notify(&self.ctx, notification)),
        )
        .await;

        let mut pending = Vec::new();
        let mut first_error = None;
        for (notification, result) in notifications.into_iter().zip(results) {
            if let Err(e) = result {
                first_error.get_or_insert(e);
                pending.push(notification);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err((pending, e)),
        }
    }
}

/// Awaits every per-curve call. No call is cancelled when another fails;
/// the first failure (in curve order) is returned once all have finished.
async fn join_per_curve<T, F>(calls: Vec<(Curve, F)>) -> Result<BTreeMap<Curve, T>>
where
    F: Future<Output = std::result::Result<T, EngineError>>,
{
    let (curves, futures): (Vec<Curve>, Vec<F>) = calls.into_iter().unzip();
    let results = join_all(futures).await;

    let mut values = BTreeMap::new();
    let mut first_error = None;
    for (curve, result) in curves.into_iter().zip(results) {
        match result {
            Ok(value) => {
                values.insert(curve, value);
            }
            Err(e) => {
                warn!(%curve, error = %e, "engine call failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        None => Ok(values),
        Some(e) => Err(e.into()),
    }
}

/// Checks a share returned for `curve` is usable by this build
fn parse_share(curve: Curve, share: &ShareMaterial) -> Result<()> {
    let malformed = |reason: String| LifecycleError::MalformedShare { curve, reason };
    if share.curve != curve {
        return Err(malformed(format!("share is tagged {}", share.curve)));
    }
    if share.data.trim().is_empty() {
        return Err(malformed("empty share blob".to_string()));
    }
    if share.share_pair_id.is_empty() {
        return Err(malformed("missing share pair id".to_string()));
    }
    if share.protocol_version != SUPPORTED_PROTOCOL_VERSION {
        return Err(malformed(format!(
            "share was produced by protocol {}",
            share.protocol_version
        )));
    }
    Ok(())
}

/// secp256k1 when present, otherwise ed25519
fn primary_curve(curves: impl IntoIterator<Item = Curve>) -> Option<Curve> {
    curves.into_iter().min()
}

/// Validates minted shares and picks the primary address
fn split_minted(minted: BTreeMap<Curve, MintedShare>) -> Result<(String, BTreeMap<Curve, ShareMaterial>)> {
    let primary = primary_curve(minted.keys().copied())
        .ok_or_else(|| LifecycleError::Config("no curves configured".to_string()))?;
    let mut address = String::new();
    let mut shares = BTreeMap::new();
    for (curve, MintedShare { share, address: minted_address }) in minted {
        parse_share(curve, &share)?;
        if minted_address.is_empty() {
            return Err(LifecycleError::MalformedShare {
                curve,
                reason: "engine returned no address".to_string(),
            });
        }
        if curve == primary {
            address = minted_address;
        }
        shares.insert(curve, share);
    }
    Ok((address, shares))
}

fn signing_stored(record: &WalletRecord) -> Vec<Notification> {
    record
        .shares()
        .iter()
        .map(|(&curve, share)| Notification::SigningStored {
            curve,
            share_pair_id: share.share_pair_id.clone(),
        })
        .collect()
}

fn backup_stored(payload: &BackupPayload) -> Vec<Notification> {
    payload
        .shares
        .iter()
        .map(|(&curve, share)| Notification::BackupStored {
            curve,
            share_pair_id: share.share_pair_id.clone(),
        })
        .collect()
}
