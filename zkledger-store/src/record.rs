//! Persisted record schemas.

use serde::{Deserialize, Serialize};
use zkledger_merkle::{Digest, DIGEST_LEN};

use crate::StoreError;

/// One dense-tree leaf plus the root the tree had right after it was inserted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseLeafRecord {
    pub index: u64,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    #[serde(with = "hex_digest")]
    pub root: Digest,
}

/// Canonical state of a sparse tree, rewritten on every commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SparseMetaRecord {
    #[serde(with = "hex_digest")]
    pub root: Digest,
    pub depth: usize,
    pub hash: String,
    pub count: u64,
}

macro_rules! json_record {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
                Ok(serde_json::to_vec(self)?)
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
                Ok(serde_json::from_slice(bytes)?)
            }
        }
    };
}

json_record!(DenseLeafRecord);
json_record!(SparseMetaRecord);

/// Encode a sparse internal node as `left || right`.
pub fn encode_node(children: &[Digest; 2]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DIGEST_LEN * 2);
    bytes.extend_from_slice(&children[0]);
    bytes.extend_from_slice(&children[1]);
    bytes
}

pub fn decode_node(bytes: &[u8]) -> Result<[Digest; 2], StoreError> {
    if bytes.len() != DIGEST_LEN * 2 {
        return Err(StoreError::Codec(format!(
            "sparse node must be {} bytes, got {}",
            DIGEST_LEN * 2,
            bytes.len()
        )));
    }
    let mut left = [0u8; DIGEST_LEN];
    let mut right = [0u8; DIGEST_LEN];
    left.copy_from_slice(&bytes[..DIGEST_LEN]);
    right.copy_from_slice(&bytes[DIGEST_LEN..]);
    Ok([left, right])
}

/// Serde module for arbitrary bytes as a `0x`-prefixed hex string.
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let hex_str = text.strip_prefix("0x").unwrap_or(&text);
        hex::decode(hex_str).map_err(de::Error::custom)
    }
}

/// [`hex_bytes`] for optional fields; `None` is `null`.
pub mod hex_bytes_opt {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => super::hex_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|text| {
                let hex_str = text.strip_prefix("0x").unwrap_or(&text);
                hex::decode(hex_str).map_err(de::Error::custom)
            })
            .transpose()
    }
}

/// Serde module for a 32-byte digest as hex, rejecting any other length.
pub mod hex_digest {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use zkledger_merkle::{digest_from_hex, Digest};

    pub fn serialize<S>(digest: &Digest, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(digest)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        digest_from_hex(&text).map_err(de::Error::custom)
    }
}
