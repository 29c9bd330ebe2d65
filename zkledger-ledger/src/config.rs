//! Environment-driven configuration.

use std::{env, path::PathBuf};

use zkledger_merkle::{HashKind, MAX_SPARSE_DEPTH};
use zkledger_store::RecordStore;

use crate::{vault::KEY_LEN, LedgerError, LedgerParams};

pub const DB_PATH_ENV: &str = "ZKLEDGER_DB_PATH";
pub const IN_MEMORY_ENV: &str = "ZKLEDGER_IN_MEMORY";
pub const HASH_ENV: &str = "ZKLEDGER_HASH";
pub const SPARSE_DEPTH_ENV: &str = "ZKLEDGER_SPARSE_DEPTH";
pub const SUBJECT_PREFIX_ENV: &str = "ZKLEDGER_SUBJECT_PREFIX";
pub const NOTE_KEY_ENV: &str = "ZKLEDGER_NOTE_KEY";

pub const DEFAULT_DB_PATH: &str = "data/zkledger.db";
pub const DEFAULT_SUBJECT_PREFIX: &str = "zkledger";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub in_memory: bool,
    pub hash: HashKind,
    pub sparse_depth: usize,
    pub subject_prefix: String,
    /// Raw AES-256 key for callers that manage a single note key themselves.
    pub note_key: Option<[u8; KEY_LEN]>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            in_memory: false,
            hash: HashKind::default(),
            sparse_depth: MAX_SPARSE_DEPTH,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            note_key: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, LedgerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LedgerError> {
        let mut config = Self::default();

        if let Some(path) = lookup(DB_PATH_ENV) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup(IN_MEMORY_ENV) {
            config.in_memory = parse_flag(&flag);
        }
        if let Some(hash) = lookup(HASH_ENV) {
            config.hash = hash
                .parse()
                .map_err(|err| LedgerError::Config(format!("{HASH_ENV}: {err}")))?;
        }
        if let Some(depth) = lookup(SPARSE_DEPTH_ENV) {
            let depth: usize = depth
                .trim()
                .parse()
                .map_err(|err| LedgerError::Config(format!("{SPARSE_DEPTH_ENV}: {err}")))?;
            if depth == 0 || depth > MAX_SPARSE_DEPTH {
                return Err(LedgerError::Config(format!(
                    "{SPARSE_DEPTH_ENV} must be in 1..={MAX_SPARSE_DEPTH}, got {depth}"
                )));
            }
            config.sparse_depth = depth;
        }
        if let Some(prefix) = lookup(SUBJECT_PREFIX_ENV) {
            config.subject_prefix = prefix;
        }
        if let Some(key) = lookup(NOTE_KEY_ENV) {
            let trimmed = key.trim();
            let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
            let mut bytes = [0u8; KEY_LEN];
            hex::decode_to_slice(hex_str, &mut bytes)
                .map_err(|err| LedgerError::Config(format!("{NOTE_KEY_ENV}: {err}")))?;
            config.note_key = Some(bytes);
        }

        Ok(config)
    }

    pub fn open_store(&self) -> Result<RecordStore, LedgerError> {
        if self.in_memory {
            return Ok(RecordStore::in_memory());
        }
        Ok(RecordStore::persistent(&self.db_path)?)
    }

    /// Ledger parameters for `prover_id`, using `prover_id` as the key ref.
    pub fn ledger_params(&self, prover_id: &str) -> LedgerParams {
        LedgerParams {
            prover_id: prover_id.to_string(),
            key_ref: prover_id.to_string(),
            subject_prefix: self.subject_prefix.clone(),
            hasher: self.hash,
            sparse_depth: self.sparse_depth,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
