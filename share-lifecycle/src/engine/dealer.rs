//! Trusted-dealer engine built on FROST key splitting.
//!
//! The dealer keeps each wallet's whole signing key and hands out fresh
//! 2-of-2 splits of it: one half to the client, the other half kept (as the
//! server or custodian share). Rotations are new splits of the same key, so
//! every backup recovers the same address. This stands in for the hosted
//! engine during local development and tests; it is not a distributed
//! protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use frost_core::keys::{self, IdentifierList, KeyPackage};
use frost_core::{Ciphersuite, SigningKey, VerifyingKey};
use frost_ed25519::Ed25519Sha512;
use frost_ed25519::rand_core::OsRng;
use frost_secp256k1::Secp256K1Sha256;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{EngineContext, EngineError, MintedShare, Notification, RemoteShareEngine, codes};
use crate::config::SUPPORTED_PROTOCOL_VERSION;
use crate::models::{Curve, PrivateKey, ShareMaterial};

struct WalletSecret {
    curve: Curve,
    signing_key: Zeroizing<Vec<u8>>,
    address: String,
    ejected: bool,
}

#[derive(Default)]
struct DealerState {
    /// `curve:verifying-key-hex` -> secret
    wallets: HashMap<String, WalletSecret>,
    /// share pair id -> wallet id
    issued_pairs: HashMap<String, String>,
    confirmed_pairs: HashSet<String>,
    /// share pair id -> hex custodian half of a backup split
    custodian_shares: HashMap<String, String>,
}

/// In-process [`RemoteShareEngine`] backed by a FROST trusted dealer
#[derive(Default)]
pub struct DealerEngine {
    state: Mutex<DealerState>,
}

impl DealerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custodian half of the backup split identified by `share_pair_id`
    pub fn custodian_share(&self, share_pair_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.custodian_shares.get(share_pair_id).cloned())
    }

    /// Whether the engine received a stored notification for the pair
    pub fn is_confirmed(&self, share_pair_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.confirmed_pairs.contains(share_pair_id))
            .unwrap_or(false)
    }

    pub fn is_ejected(&self, curve: Curve, address: &str) -> bool {
        self.state
            .lock()
            .map(|s| {
                s.wallets
                    .values()
                    .any(|w| w.curve == curve && w.address == address && w.ejected)
            })
            .unwrap_or(false)
    }

    fn state(&self) -> Result<MutexGuard<'_, DealerState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::remote(codes::INTERNAL, "dealer state poisoned"))
    }

    /// Finds the live wallet a client share belongs to.
    /// Returns `(wallet id, signing key, address)`.
    fn lookup(&self, share: &ShareMaterial) -> Result<(String, Zeroizing<Vec<u8>>, String), EngineError> {
        let bytes = hex::decode(&share.data)
            .map_err(|e| EngineError::remote(codes::INVALID_SHARE, format!("share is not hex: {}", e)))?;
        let verifying_key = package_verifying_key(share.curve, &bytes)
            .map_err(|e| EngineError::remote(codes::INVALID_SHARE, e))?;
        let wallet_id = wallet_id(share.curve, &verifying_key);

        let state = self.state()?;
        let wallet = state
            .wallets
            .get(&wallet_id)
            .ok_or_else(|| EngineError::remote(codes::UNKNOWN_WALLET, "no wallet for this share"))?;
        if wallet.ejected {
            return Err(EngineError::remote(codes::ALREADY_EJECTED, "wallet has been ejected"));
        }
        Ok((wallet_id, wallet.signing_key.clone(), wallet.address.clone()))
    }

    /// Splits the wallet key again, remembering the kept half under a new
    /// pair id. Returns the client half.
    fn issue_split(
        &self,
        curve: Curve,
        wallet_id: String,
        signing_key: &[u8],
        keep_as_custodian: bool,
    ) -> Result<ShareMaterial, EngineError> {
        let (client, kept) = split_serialized(curve, signing_key).map_err(internal)?;
        let share_pair_id = Uuid::new_v4().to_string();

        let mut state = self.state()?;
        if keep_as_custodian {
            state.custodian_shares.insert(share_pair_id.clone(), hex::encode(kept));
        }
        state.issued_pairs.insert(share_pair_id.clone(), wallet_id);

        Ok(ShareMaterial::new(
            curve,
            share_pair_id,
            SUPPORTED_PROTOCOL_VERSION,
            hex::encode(client),
        ))
    }
}

#[async_trait]
impl RemoteShareEngine for DealerEngine {
    async fn generate(&self, _ctx: &EngineContext, curve: Curve) -> Result<MintedShare, EngineError> {
        let (signing_key, verifying_key) = new_key(curve).map_err(internal)?;
        let address = derive_address(curve, &verifying_key).map_err(internal)?;
        let wallet_id = wallet_id(curve, &verifying_key);

        self.state()?.wallets.insert(
            wallet_id.clone(),
            WalletSecret {
                curve,
                signing_key: signing_key.clone(),
                address: address.clone(),
                ejected: false,
            },
        );
        let share = self.issue_split(curve, wallet_id, &signing_key, false)?;
        info!(%curve, %address, "dealer generated wallet");
        Ok(MintedShare { share, address })
    }

    async fn backup(
        &self,
        _ctx: &EngineContext,
        signing_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError> {
        let (wallet_id, signing_key, _) = self.lookup(signing_share)?;
        self.issue_split(signing_share.curve, wallet_id, &signing_key, true)
    }

    async fn recover_signing(
        &self,
        _ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<MintedShare, EngineError> {
        let (wallet_id, signing_key, address) = self.lookup(backup_share)?;
        let share = self.issue_split(backup_share.curve, wallet_id, &signing_key, false)?;
        Ok(MintedShare { share, address })
    }

    async fn recover_backup(
        &self,
        _ctx: &EngineContext,
        backup_share: &ShareMaterial,
    ) -> Result<ShareMaterial, EngineError> {
        let (wallet_id, signing_key, _) = self.lookup(backup_share)?;
        self.issue_split(backup_share.curve, wallet_id, &signing_key, true)
    }

    async fn notify(&self, _ctx: &EngineContext, notification: &Notification) -> Result<(), EngineError> {
        let mut state = self.state()?;
        match notification {
            Notification::SigningStored { share_pair_id, .. }
            | Notification::BackupStored { share_pair_id, .. } => {
                if !state.issued_pairs.contains_key(share_pair_id) {
                    return Err(EngineError::remote(
                        codes::UNKNOWN_SHARE_PAIR,
                        format!("unknown share pair {}", share_pair_id),
                    ));
                }
                state.confirmed_pairs.insert(share_pair_id.clone());
            }
            Notification::Ejected { share_pair_id, .. } => {
                let wallet_id = state.issued_pairs.get(share_pair_id).cloned().ok_or_else(|| {
                    EngineError::remote(
                        codes::UNKNOWN_SHARE_PAIR,
                        format!("unknown share pair {}", share_pair_id),
                    )
                })?;
                let wallet = state
                    .wallets
                    .get_mut(&wallet_id)
                    .ok_or_else(|| EngineError::remote(codes::UNKNOWN_WALLET, "no wallet for this share pair"))?;
                wallet.ejected = true;
            }
        }
        debug!(?notification, "dealer recorded notification");
        Ok(())
    }

    async fn eject(
        &self,
        client_backup_share: &ShareMaterial,
        custodian_backup_share: &str,
    ) -> Result<PrivateKey, EngineError> {
        let curve = client_backup_share.curve;
        let client = hex::decode(&client_backup_share.data)
            .map_err(|e| EngineError::remote(codes::INVALID_SHARE, format!("client share is not hex: {}", e)))?;
        let custodian = hex::decode(custodian_backup_share)
            .map_err(|e| EngineError::remote(codes::INVALID_SHARE, format!("custodian share is not hex: {}", e)))?;

        let (signing_key, verifying_key) =
            combine(curve, &client, &custodian).map_err(|e| EngineError::remote(codes::INVALID_SHARE, e))?;

        let state = self.state()?;
        match state.wallets.get(&wallet_id(curve, &verifying_key)) {
            Some(wallet) if wallet.ejected => {
                Err(EngineError::remote(codes::ALREADY_EJECTED, "wallet has been ejected"))
            }
            Some(_) => Ok(PrivateKey::new(hex::encode(signing_key.as_slice()))),
            None => Err(EngineError::remote(
                codes::KEY_MISMATCH,
                "client and custodian shares do not belong to the same split",
            )),
        }
    }
}

fn internal(reason: String) -> EngineError {
    EngineError::remote(codes::INTERNAL, reason)
}

fn wallet_id(curve: Curve, verifying_key: &[u8]) -> String {
    format!("{}:{}", curve, hex::encode(verifying_key))
}

/// Address controlled by a serialized group verifying key
pub fn derive_address(curve: Curve, verifying_key: &[u8]) -> Result<String, String> {
    match curve {
        Curve::Secp256k1 => {
            let public_key = k256::PublicKey::from_sec1_bytes(verifying_key)
                .map_err(|e| format!("Failed to parse compressed public key: {}", e))?;
            let uncompressed = public_key.to_encoded_point(false);
            let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
            Ok(format!("0x{}", hex::encode(&hash[12..])))
        }
        Curve::Ed25519 => Ok(bs58::encode(verifying_key).into_string()),
    }
}

/// Address controlled by a hex private key returned from ejection
pub fn address_for_private_key(curve: Curve, private_key_hex: &str) -> Result<String, String> {
    let bytes = hex::decode(private_key_hex).map_err(|e| e.to_string())?;
    let verifying_key = match curve {
        Curve::Secp256k1 => verifying_key_of::<Secp256K1Sha256>(&bytes)?,
        Curve::Ed25519 => verifying_key_of::<Ed25519Sha512>(&bytes)?,
    };
    derive_address(curve, &verifying_key)
}

fn new_key(curve: Curve) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), String> {
    match curve {
        Curve::Secp256k1 => new_key_for::<Secp256K1Sha256>(),
        Curve::Ed25519 => new_key_for::<Ed25519Sha512>(),
    }
}

fn split_serialized(curve: Curve, signing_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), String> {
    match curve {
        Curve::Secp256k1 => split_for::<Secp256K1Sha256>(signing_key),
        Curve::Ed25519 => split_for::<Ed25519Sha512>(signing_key),
    }
}

fn package_verifying_key(curve: Curve, package: &[u8]) -> Result<Vec<u8>, String> {
    match curve {
        Curve::Secp256k1 => package_verifying_key_for::<Secp256K1Sha256>(package),
        Curve::Ed25519 => package_verifying_key_for::<Ed25519Sha512>(package),
    }
}

fn combine(curve: Curve, a: &[u8], b: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), String> {
    match curve {
        Curve::Secp256k1 => combine_for::<Secp256K1Sha256>(a, b),
        Curve::Ed25519 => combine_for::<Ed25519Sha512>(a, b),
    }
}

fn new_key_for<C: Ciphersuite>() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), String> {
    let mut rng = OsRng;
    let signing_key = SigningKey::<C>::new(&mut rng);
    let verifying_key = VerifyingKey::<C>::from(&signing_key)
        .serialize()
        .map_err(|e| e.to_string())?;
    Ok((Zeroizing::new(signing_key.serialize()), verifying_key))
}

fn verifying_key_of<C: Ciphersuite>(signing_key: &[u8]) -> Result<Vec<u8>, String> {
    let signing_key = SigningKey::<C>::deserialize(signing_key).map_err(|e| e.to_string())?;
    VerifyingKey::<C>::from(&signing_key)
        .serialize()
        .map_err(|e| e.to_string())
}

/// 2-of-2 split; the first identifier's package goes to the client
fn split_for<C: Ciphersuite>(signing_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), String> {
    let mut rng = OsRng;
    let signing_key = SigningKey::<C>::deserialize(signing_key).map_err(|e| e.to_string())?;
    let (shares, _public) = keys::split(&signing_key, 2, 2, IdentifierList::Default, &mut rng)
        .map_err(|e| e.to_string())?;

    let mut packages = Vec::with_capacity(2);
    for share in shares.into_values() {
        let package = KeyPackage::<C>::try_from(share).map_err(|e| e.to_string())?;
        packages.push(package.serialize().map_err(|e| e.to_string())?);
    }
    let kept = packages.pop().ok_or_else(|| "split produced no shares".to_string())?;
    let client = packages.pop().ok_or_else(|| "split produced one share".to_string())?;
    Ok((client, kept))
}

fn package_verifying_key_for<C: Ciphersuite>(package: &[u8]) -> Result<Vec<u8>, String> {
    let package = KeyPackage::<C>::deserialize(package).map_err(|e| e.to_string())?;
    package.verifying_key().serialize().map_err(|e| e.to_string())
}

fn combine_for<C: Ciphersuite>(a: &[u8], b: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), String> {
    let a = KeyPackage::<C>::deserialize(a).map_err(|e| e.to_string())?;
    let b = KeyPackage::<C>::deserialize(b).map_err(|e| e.to_string())?;
    if a.identifier() == b.identifier() {
        return Err("both shares carry the same identifier".to_string());
    }
    let signing_key = keys::reconstruct(&[a, b]).map_err(|e| e.to_string())?;
    let verifying_key = VerifyingKey::<C>::from(&signing_key)
        .serialize()
        .map_err(|e| e.to_string())?;
    Ok((Zeroizing::new(signing_key.serialize()), verifying_key))
}
