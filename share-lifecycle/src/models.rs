//! Data models for the share lifecycle.
//!
//! This module defines the wallet record held by the share repository, the
//! opaque share material minted by the remote engine, and the backup blob
//! written to an encrypted storage backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

/// Signature curve a share is valid for
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    /// ECDSA over secp256k1 (Ethereum style addresses)
    Secp256k1,
    /// EdDSA over ed25519 (Solana style addresses)
    Ed25519,
}

impl Curve {
    pub const ALL: [Curve; 2] = [Curve::Secp256k1, Curve::Ed25519];

    pub fn as_str(&self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
            Curve::Ed25519 => "ed25519",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Curve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secp256k1" => Ok(Curve::Secp256k1),
            "ed25519" => Ok(Curve::Ed25519),
            other => Err(format!("unknown curve: {}", other)),
        }
    }
}

/// Identifies where the decryption key of a backup lives
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackendId {
    Password,
    CloudKeyValue,
    LocalFile,
    Custodian,
    Passkey,
}

impl BackendId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Password => "password",
            BackendId::CloudKeyValue => "cloud-key-value",
            BackendId::LocalFile => "local-file",
            BackendId::Custodian => "custodian",
            BackendId::Passkey => "passkey",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One holder's fragment of a threshold key, as minted by the remote engine.
///
/// The blob is opaque to this crate. It is never constructed locally outside
/// of an engine implementation.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareMaterial {
    /// Curve the share is valid for
    pub curve: Curve,

    /// Correlates the client-held and server-held halves of one logical share
    pub share_pair_id: String,

    /// Protocol generation that produced the share
    pub protocol_version: String,

    /// Opaque share blob
    pub data: String,
}

impl ShareMaterial {
    pub fn new(
        curve: Curve,
        share_pair_id: impl Into<String>,
        protocol_version: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            curve,
            share_pair_id: share_pair_id.into(),
            protocol_version: protocol_version.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for ShareMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareMaterial")
            .field("curve", &self.curve)
            .field("share_pair_id", &self.share_pair_id)
            .field("protocol_version", &self.protocol_version)
            .field("data", &"<redacted>")
            .finish()
    }
}

/// Lifecycle state of the wallet held on this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalletState {
    #[default]
    Empty,
    Active,
    BackedUp,
    /// Terminal: the private key was extracted and signing shares discarded
    Ejected,
}

/// The wallet this device currently holds.
///
/// Callers only read records; every mutation goes through
/// [`ShareLifecycle`](crate::lifecycle::ShareLifecycle).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    address: Option<String>,
    shares: BTreeMap<Curve, ShareMaterial>,
    backup_method: Option<BackendId>,
    state: WalletState,
    updated_at: Option<DateTime<Utc>>,
}

impl WalletRecord {
    /// Creates an empty record
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn share(&self, curve: Curve) -> Option<&ShareMaterial> {
        self.shares.get(&curve)
    }

    pub fn shares(&self) -> &BTreeMap<Curve, ShareMaterial> {
        &self.shares
    }

    pub fn curves(&self) -> Vec<Curve> {
        self.shares.keys().copied().collect()
    }

    pub fn backup_method(&self) -> Option<BackendId> {
        self.backup_method
    }

    pub fn state(&self) -> WalletState {
        self.state
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// True when the record holds no signing share
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn is_ejected(&self) -> bool {
        self.state == WalletState::Ejected
    }

    pub(crate) fn activate(&mut self, address: String, shares: BTreeMap<Curve, ShareMaterial>) {
        self.address = Some(address);
        self.shares = shares;
        self.backup_method = None;
        self.state = WalletState::Active;
        self.touch();
    }

    /// Replaces the signing shares of the curves present in `shares`.
    /// Shares of other curves are left untouched.
    pub(crate) fn replace_signing_shares(
        &mut self,
        address: String,
        shares: BTreeMap<Curve, ShareMaterial>,
    ) {
        self.address = Some(address);
        self.shares.extend(shares);
        self.backup_method = None;
        self.state = WalletState::Active;
        self.touch();
    }

    pub(crate) fn set_share(&mut self, curve: Curve, share: ShareMaterial) {
        self.shares.insert(curve, share);
        if self.state == WalletState::Empty {
            self.state = WalletState::Active;
        }
        self.touch();
    }

    pub(crate) fn set_address(&mut self, address: String) {
        self.address = Some(address);
        self.touch();
    }

    pub(crate) fn mark_backed_up(&mut self, method: BackendId) {
        self.backup_method = Some(method);
        self.state = WalletState::BackedUp;
        self.touch();
    }

    pub(crate) fn mark_ejected(&mut self) {
        self.shares.clear();
        self.backup_method = None;
        self.state = WalletState::Ejected;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// An encrypted backup as handed back to the caller.
///
/// Immutable once written; recovery only reads it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupBlob {
    /// Base64 ciphertext of the serialized backup payload
    pub cipher_text: String,

    /// Key slot in the backend holding the decryption key
    pub storage_key: String,

    /// Backend the key material was written to
    pub backend_id: BackendId,
}

/// Plaintext of a backup blob: the backup share of every curve
#[derive(Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupPayload {
    pub address: String,
    pub shares: BTreeMap<Curve, ShareMaterial>,
}

/// A raw private key returned by ejection. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(Zeroizing<String>);

impl PrivateKey {
    pub fn new(hex_key: String) -> Self {
        Self(Zeroizing::new(hex_key))
    }

    /// Hex encoded key bytes
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Private keys recovered by ejection, one per curve
pub type EjectedKeys = BTreeMap<Curve, PrivateKey>;
