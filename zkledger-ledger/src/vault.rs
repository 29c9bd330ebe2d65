//! Symmetric encryption of note payloads.
//!
//! The ledger only needs `encrypt`/`decrypt` by key reference; where the keys
//! live is the vault's business. [`MemoryVault`] keeps AES-256-GCM keys in
//! process memory and seals each payload as `nonce (12 bytes) || ciphertext`.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use thiserror::Error;
use tracing::debug;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("ciphertext is corrupt or sealed under another key")]
    Corrupt,

    #[error("invalid key material: expected 32 bytes")]
    InvalidKey,

    #[error("vault unavailable")]
    Unavailable,
}

/// Encrypt/decrypt collaborator used by the ledger.
pub trait Vault: Send + Sync {
    fn encrypt(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, key_ref: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Create a fresh key under `key_ref`, replacing any existing one.
    fn generate_key(&self, key_ref: &str) -> Result<(), CryptoError>;

    /// Forget `key_ref`; returns whether a key was present.
    fn remove_key(&self, key_ref: &str) -> Result<bool, CryptoError>;
}

/// In-process AES-256-GCM vault.
#[derive(Default)]
pub struct MemoryVault {
    keys: RwLock<HashMap<String, [u8; KEY_LEN]>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install existing key material under `key_ref`.
    pub fn set_key(&self, key_ref: &str, key: &[u8]) -> Result<(), CryptoError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::InvalidKey)?;
        self.write()?.insert(key_ref.to_string(), key);
        Ok(())
    }

    pub fn has_key(&self, key_ref: &str) -> bool {
        self.read().map(|keys| keys.contains_key(key_ref)).unwrap_or(false)
    }

    fn cipher(&self, key_ref: &str) -> Result<Aes256Gcm, CryptoError> {
        let keys = self.read()?;
        let key = keys
            .get(key_ref)
            .ok_or_else(|| CryptoError::KeyNotFound(key_ref.to_string()))?;
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, [u8; KEY_LEN]>>, CryptoError> {
        self.keys.read().map_err(|_| CryptoError::Unavailable)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, [u8; KEY_LEN]>>, CryptoError> {
        self.keys.write().map_err(|_| CryptoError::Unavailable)
    }
}

impl Vault for MemoryVault {
    fn encrypt(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher(key_ref)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Corrupt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, key_ref: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Corrupt);
        }
        let cipher = self.cipher(key_ref)?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Corrupt)
    }

    fn generate_key(&self, key_ref: &str) -> Result<(), CryptoError> {
        let key: [u8; KEY_LEN] = rand::random();
        self.write()?.insert(key_ref.to_string(), key);
        debug!(key_ref, "generated vault key");
        Ok(())
    }

    fn remove_key(&self, key_ref: &str) -> Result<bool, CryptoError> {
        Ok(self.write()?.remove(key_ref).is_some())
    }
}
