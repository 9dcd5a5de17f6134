//! Remote share engine.
//!
//! The engine is the external service that mints, rotates and combines
//! shares. This crate only sees opaque [`ShareMaterial`] and typed error
//! codes; the threshold protocol itself lives on the other side of
//! [`RemoteShareEngine`].

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::LifecycleConfig;
use crate::models::{Curve, PrivateKey, ShareMaterial};

pub mod client;
pub mod dealer;
pub mod websocket;
pub mod wire;

pub use client::{EngineTransport, JsonEngineClient, LoopbackTransport};
pub use dealer::DealerEngine;
pub use websocket::WebSocketTransport;

/// Error codes carried in the `error.code` field of an engine reply
pub mod codes {
    pub const OK: i64 = 0;
    pub const INTERNAL: i64 = 1;
    pub const BAD_REQUEST: i64 = 2;
    pub const INVALID_SHARE: i64 = 101;
    pub const UNKNOWN_WALLET: i64 = 104;
    pub const UNKNOWN_SHARE_PAIR: i64 = 105;
    pub const KEY_MISMATCH: i64 = 106;
    pub const ALREADY_EJECTED: i64 = 107;
}

/// Errors surfaced by an engine implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Remote engine error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Engine transport error: {0}")]
    Transport(String),

    #[error("Malformed engine response: {0}")]
    MalformedResponse(String),
}

impl EngineError {
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        EngineError::Remote {
            code,
            message: message.into(),
        }
    }
}

/// Credentials and routing forwarded with every engine call
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineContext {
    pub api_key: String,
    pub host: String,
    pub api_host: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&LifecycleConfig> for EngineContext {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            host: config.host.clone(),
            api_host: config.api_host.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

/// A freshly minted signing share together with the address it controls
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MintedShare {
    pub share: ShareMaterial,
    pub address: String,
}

/// Bookkeeping messages telling the engine a step became durable
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// The client signing share is durably stored on the device
    #[serde(rename_all = "camelCase")]
    SigningStored { curve: Curve, share_pair_id: String },

    /// The backup share's key material is durably written to a backend
    #[serde(rename_all = "camelCase")]
    BackupStored { curve: Curve, share_pair_id: String },

    /// The client has extracted the private key of the wallet the backup
    /// pair belongs to; terminal
    #[serde(rename_all = "camelCase")]
    Ejected { curve: Curve, share_pair_id: String },
}

/// Call surface of the remote compute engine.
///
/// Implementations must be safe to call concurrently for distinct curves.
#[async_trait]
pub trait RemoteShareEngine: Send + Sync {
    /// Runs key generation for one curve and returns the client signing share
    async fn generate(&self, ctx: &EngineContext, curve: Curve) -> Result<MintedShare, EngineError>;

    /// Rotates a signing share into a fresh client backup share
    async fn backup(
        &self,
        ctx: &EngineContext,
        signing_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError>;

    /// Mints a new signing share from a backup share
    async fn recover_signing(
        &self,
        ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<MintedShare, EngineError>;

    /// Mints a new backup share from an existing backup share
    async fn recover_backup(
        &self,
        ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError>;

    async fn notify(&self, ctx: &EngineContext, notification: &Notification) -> Result<(), EngineError>;

    /// Combines the client and custodian backup halves into the private key
    async fn eject(
        &self,
        client_backup_share: &ShareMaterial,
        custodian_backup_share: &str,
    ) -> Result<PrivateKey, EngineError>;
}
