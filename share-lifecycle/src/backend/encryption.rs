//! Encryption primitives for backups and the local share repository.
//!
//! Password encryption uses AES-256-GCM with an Argon2id derived key; key
//! encryption uses AES-256-GCM directly with a random 256-bit key.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use argon2::{Argon2, Params};
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::BackendError;

// Constants for encryption parameters
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
pub(crate) const KEY_LEN: usize = 32; // 256 bits

fn argon2() -> Result<Argon2<'static>, String> {
    let params = Params::new(4096, 3, 1, Some(KEY_LEN)).map_err(|e| e.to_string())?;
    Ok(Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params))
}

fn derive_password_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2()?
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| e.to_string())?;
    Ok(key)
}

/// Fresh random 256-bit key
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

/// Encrypts data with a password using AES-256-GCM with Argon2id key derivation.
///
/// The output format is: `salt (16 bytes) + nonce (12 bytes) + ciphertext`
pub fn encrypt_with_password(data: &[u8], password: &str) -> Result<Vec<u8>, BackendError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_password_key(password, &salt).map_err(BackendError::Encryption)?;

    let sealed = seal(data, &key[..]).map_err(BackendError::Encryption)?;

    let mut result = Vec::with_capacity(SALT_LEN + sealed.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&sealed);
    Ok(result)
}

/// Decrypts data that was encrypted with [`encrypt_with_password`].
///
/// A wrong password and tampered ciphertext are indistinguishable here; both
/// fail authentication.
pub fn decrypt_with_password(encrypted_data: &[u8], password: &str) -> Result<Vec<u8>, BackendError> {
    if encrypted_data.len() < SALT_LEN + NONCE_LEN {
        return Err(BackendError::Decryption("Invalid encrypted data format".to_string()));
    }
    let (salt, sealed) = encrypted_data.split_at(SALT_LEN);
    let key = derive_password_key(password, salt).map_err(BackendError::Decryption)?;
    open(sealed, &key[..])
        .map_err(|_| BackendError::Decryption("invalid password or corrupted backup".to_string()))
}

/// Encrypts data with a raw 256-bit key.
///
/// The output format is: `nonce (12 bytes) + ciphertext`
pub fn encrypt_with_key(data: &[u8], key: &[u8]) -> Result<Vec<u8>, BackendError> {
    seal(data, key).map_err(BackendError::Encryption)
}

/// Decrypts data that was encrypted with [`encrypt_with_key`]
pub fn decrypt_with_key(encrypted_data: &[u8], key: &[u8]) -> Result<Vec<u8>, BackendError> {
    if encrypted_data.len() < NONCE_LEN {
        return Err(BackendError::Decryption("Invalid encrypted data format".to_string()));
    }
    open(encrypted_data, key).map_err(|_| BackendError::Decryption("wrong key or corrupted backup".to_string()))
}

/// HKDF-SHA256 expansion of authenticator output into a 256-bit key
pub fn derive_key(input_key: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<Vec<u8>>, BackendError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key);
    let mut okm = Zeroizing::new(vec![0u8; KEY_LEN]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|e| BackendError::Encryption(e.to_string()))?;
    Ok(okm)
}

fn seal(data: &[u8], key: &[u8]) -> Result<Vec<u8>, String> {
    if key.len() != KEY_LEN {
        return Err(format!("expected a {} byte key, got {}", KEY_LEN, key.len()));
    }
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher.encrypt(nonce, data).map_err(|e| e.to_string())?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn open(sealed: &[u8], key: &[u8]) -> Result<Vec<u8>, String> {
    if key.len() != KEY_LEN {
        return Err(format!("expected a {} byte key, got {}", KEY_LEN, key.len()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_encryption_decryption() {
        let data = b"This is a test message";
        let encrypted = encrypt_with_password(data, "test_password").unwrap();
        let decrypted = decrypt_with_password(&encrypted, "test_password").unwrap();
        assert_eq!(data.to_vec(), decrypted);
    }

    #[test]
    fn test_decryption_wrong_password() {
        let encrypted = encrypt_with_password(b"secret", "test_password").unwrap();
        let result = decrypt_with_password(&encrypted, "wrong_password");
        assert!(matches!(result, Err(BackendError::Decryption(_))));
    }

    #[test]
    fn test_decryption_corrupted_data() {
        let key = generate_key();
        let mut encrypted = encrypt_with_key(b"This is a test message", &key).unwrap();
        encrypted[NONCE_LEN + 1] ^= 0x01;
        assert!(decrypt_with_key(&encrypted, &key).is_err());
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(decrypt_with_password(&[0u8; 10], "pw").is_err());
        assert!(decrypt_with_key(&[0u8; 4], &generate_key()).is_err());
    }

    #[test]
    fn test_same_plaintext_encrypts_differently() {
        let key = generate_key();
        let a = encrypt_with_key(b"payload", &key).unwrap();
        let b = encrypt_with_key(b"payload", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(b"prf-output", b"slot-1", b"info").unwrap();
        let b = derive_key(b"prf-output", b"slot-1", b"info").unwrap();
        let c = derive_key(b"prf-output", b"slot-2", b"info").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_eq!(a.len(), KEY_LEN);
    }
}
