//! JSON envelope client for the remote engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::wire::{
    BackupParams, EjectParams, EngineCall, EngineReply, EngineRequest, GenerateParams, NotifyParams,
    RecoverParams, dispatch,
};
use super::{EngineContext, EngineError, MintedShare, Notification, RemoteShareEngine};
use crate::models::{Curve, PrivateKey, ShareMaterial};

/// Moves one request frame to the engine and returns its reply frame
#[async_trait]
pub trait EngineTransport: Send + Sync {
    async fn round_trip(&self, request: EngineRequest) -> Result<EngineReply, EngineError>;
}

/// [`RemoteShareEngine`] speaking the JSON envelope protocol over any
/// [`EngineTransport`]
pub struct JsonEngineClient<T> {
    transport: T,
    next_id: AtomicU64,
}

impl<T: EngineTransport> JsonEngineClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<R: DeserializeOwned>(&self, call: EngineCall) -> Result<R, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = self.transport.round_trip(EngineRequest { id, call }).await?;
        if reply.id != id {
            return Err(EngineError::MalformedResponse(format!(
                "reply id {} does not match request id {}",
                reply.id, id
            )));
        }
        reply.into_result()
    }
}

#[async_trait]
impl<T: EngineTransport> RemoteShareEngine for JsonEngineClient<T> {
    async fn generate(&self, ctx: &EngineContext, curve: Curve) -> Result<MintedShare, EngineError> {
        self.call(EngineCall::Generate(GenerateParams {
            context: ctx.clone(),
            curve,
        }))
        .await
    }

    async fn backup(
        &self,
        ctx: &EngineContext,
        signing_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError> {
        self.call(EngineCall::Backup(BackupParams {
            context: ctx.clone(),
            signing_share: signing_share.clone(),
        }))
        .await
    }

    async fn recover_signing(
        &self,
        ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<MintedShare, EngineError> {
        self.call(EngineCall::RecoverSigning(RecoverParams {
            context: ctx.clone(),
            backup_share: backup_share.clone(),
        }))
        .await
    }

    async fn recover_backup(
        &self,
        ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError> {
        self.call(EngineCall::RecoverBackup(RecoverParams {
            context: ctx.clone(),
            backup_share: backup_share.clone(),
        }))
        .await
    }

    async fn notify(&self, ctx: &EngineContext, notification: &Notification) -> Result<(), EngineError> {
        self.call(EngineCall::Notify(NotifyParams {
            context: ctx.clone(),
            notification: notification.clone(),
        }))
        .await
    }

    async fn eject(
        &self,
        client_backup_share: &ShareMaterial,
        custodian_backup_share: &str,
    ) -> Result<PrivateKey, EngineError> {
        let key: String = self
            .call(EngineCall::Eject(EjectParams {
                client_backup_share: client_backup_share.clone(),
                custodian_backup_share: custodian_backup_share.to_string(),
            }))
            .await?;
        Ok(PrivateKey::new(key))
    }
}

/// In-process transport that serializes every frame to JSON text and serves
/// it with a local engine. Exercises the full wire path without a socket.
pub struct LoopbackTransport {
    engine: Arc<dyn RemoteShareEngine>,
}

impl LoopbackTransport {
    pub fn new(engine: Arc<dyn RemoteShareEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    async fn round_trip(&self, request: EngineRequest) -> Result<EngineReply, EngineError> {
        let text = serde_json::to_string(&request).map_err(|e| EngineError::Transport(e.to_string()))?;
        let request: EngineRequest =
            serde_json::from_str(&text).map_err(|e| EngineError::Transport(e.to_string()))?;

        let reply = dispatch(self.engine.as_ref(), request).await;

        let text = serde_json::to_string(&reply).map_err(|e| EngineError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| EngineError::MalformedResponse(e.to_string()))
    }
}
