//! Hash strategies shared by the dense and sparse trees.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::TreeError;

/// Width in bytes of every digest produced by a [`HashStrategy`].
pub const DIGEST_LEN: usize = 32;

/// A fixed-width digest. Also the key type of the sparse tree.
pub type Digest = [u8; DIGEST_LEN];

/// A fixed-output cryptographic hash used uniformly by both trees.
pub trait HashStrategy: Clone + Send + Sync + 'static {
    /// Stable identifier, persisted alongside sparse tree metadata.
    fn name(&self) -> &'static str;

    /// Hash an arbitrary byte string.
    fn digest(&self, data: &[u8]) -> Digest;

    /// Hash the concatenation `left || right`.
    fn digest_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut buf = [0u8; DIGEST_LEN * 2];
        buf[..DIGEST_LEN].copy_from_slice(left);
        buf[DIGEST_LEN..].copy_from_slice(right);
        self.digest(&buf)
    }
}

/// SHA-256.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sha256;

impl HashStrategy for Sha256 {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        sha2::Sha256::digest(data).into()
    }
}

/// SHA3-256.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sha3_256;

impl HashStrategy for Sha3_256 {
    fn name(&self) -> &'static str {
        "sha3-256"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        sha3::Sha3_256::digest(data).into()
    }
}

/// BLAKE3 in its default 32-byte output mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Blake3;

impl HashStrategy for Blake3 {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        *blake3::hash(data).as_bytes()
    }

    fn digest_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }
}

/// Runtime-selectable hash strategy.
///
/// Lets configuration pick the hash without making every caller generic over
/// a concrete strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashKind {
    #[default]
    Sha256,
    #[serde(rename = "sha3-256")]
    Sha3_256,
    Blake3,
}

impl HashStrategy for HashKind {
    fn name(&self) -> &'static str {
        match self {
            HashKind::Sha256 => Sha256.name(),
            HashKind::Sha3_256 => Sha3_256.name(),
            HashKind::Blake3 => Blake3.name(),
        }
    }

    fn digest(&self, data: &[u8]) -> Digest {
        match self {
            HashKind::Sha256 => Sha256.digest(data),
            HashKind::Sha3_256 => Sha3_256.digest(data),
            HashKind::Blake3 => Blake3.digest(data),
        }
    }

    fn digest_pair(&self, left: &Digest, right: &Digest) -> Digest {
        match self {
            HashKind::Sha256 => Sha256.digest_pair(left, right),
            HashKind::Sha3_256 => Sha3_256.digest_pair(left, right),
            HashKind::Blake3 => Blake3.digest_pair(left, right),
        }
    }
}

impl FromStr for HashKind {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashKind::Sha256),
            "sha3-256" | "sha3" => Ok(HashKind::Sha3_256),
            "blake3" => Ok(HashKind::Blake3),
            other => Err(TreeError::UnknownHash(other.to_string())),
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decode a hex string (optionally `0x`-prefixed) into a digest.
pub fn digest_from_hex(s: &str) -> Result<Digest, TreeError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| TreeError::InvalidDigest(e.to_string()))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        TreeError::InvalidDigest(format!(
            "expected {} bytes, got {}",
            DIGEST_LEN,
            bytes.len()
        ))
    })
}
