//! Prover registration and the proving-backend boundary.
//!
//! A prover is a compiled constraint system plus its proving and verifying
//! keys. Registering one persists a [`ProverRecord`], creates a vault key for
//! its notes and opens its [`Ledger`]. Every proof generated through the
//! registry is recorded in that ledger.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zkledger_merkle::Digest;
use zkledger_store::{
    keys,
    record::{hex_bytes, hex_bytes_opt, hex_digest},
    RecordStore, WriteBatch,
};

use crate::{
    config::LedgerConfig,
    events::Publisher,
    ledger::{Ledger, LedgerParams, RecordReceipt},
    note::Note,
    vault::Vault,
    LedgerError,
};

/// Failure reported by a [`ProvingBackend`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} failed: {message}")]
pub struct ProverError {
    pub stage: &'static str,
    pub message: String,
}

impl ProverError {
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub proving_key: Vec<u8>,
    pub verifying_key: Vec<u8>,
}

/// Compile/setup/prove/verify collaborator.
pub trait ProvingBackend: Send + Sync {
    fn compile(&self, identifier: &str) -> Result<Vec<u8>, ProverError>;

    fn setup(&self, artifact: &[u8], srs: Option<&[u8]>) -> Result<KeyPair, ProverError>;

    fn prove(
        &self,
        artifact: &[u8],
        proving_key: &[u8],
        witness: &[u8],
        srs: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProverError>;

    fn verify(
        &self,
        proof: &[u8],
        verifying_key: &[u8],
        witness: &[u8],
        srs: Option<&[u8]>,
    ) -> Result<(), ProverError>;
}

/// Persisted description of a registered prover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProverRecord {
    pub id: Uuid,
    pub identifier: String,
    pub key_ref: String,
    /// BLAKE3 of `artifact`, checked on load.
    #[serde(with = "hex_digest")]
    pub artifact_hash: Digest,
    #[serde(with = "hex_bytes")]
    pub artifact: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub proving_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub verifying_key: Vec<u8>,
    #[serde(default, with = "hex_bytes_opt")]
    pub srs: Option<Vec<u8>>,
}

impl ProverRecord {
    fn check_artifact(&self) -> Result<(), LedgerError> {
        if *blake3::hash(&self.artifact).as_bytes() != self.artifact_hash {
            return Err(LedgerError::Integrity(format!(
                "artifact of prover {} does not match its recorded hash",
                self.id
            )));
        }
        Ok(())
    }
}

struct ProverEntry {
    record: ProverRecord,
    ledger: Arc<Ledger>,
}

/// Registry of provers and their ledgers.
pub struct ProverRegistry {
    store: RecordStore,
    backend: Arc<dyn ProvingBackend>,
    vault: Arc<dyn Vault>,
    publisher: Arc<dyn Publisher>,
    config: LedgerConfig,
    provers: RwLock<HashMap<Uuid, ProverEntry>>,
}

impl ProverRegistry {
    pub fn new(
        store: RecordStore,
        backend: Arc<dyn ProvingBackend>,
        vault: Arc<dyn Vault>,
        publisher: Arc<dyn Publisher>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            vault,
            publisher,
            config,
            provers: RwLock::new(HashMap::new()),
        }
    }

    /// Reopen every persisted prover and its ledger.
    pub fn load(
        store: RecordStore,
        backend: Arc<dyn ProvingBackend>,
        vault: Arc<dyn Vault>,
        publisher: Arc<dyn Publisher>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let registry = Self::new(store, backend, vault, publisher, config);
        let rows = registry.store.scan_prefix(&keys::prover_prefix())?;
        {
            let mut provers = registry.write()?;
            for (_, bytes) in rows {
                let record: ProverRecord = serde_json::from_slice(&bytes)?;
                record.check_artifact()?;
                let ledger = registry.open_ledger(&record)?;
                provers.insert(record.id, ProverEntry { record, ledger });
            }
            info!(provers = provers.len(), "loaded prover registry");
        }
        Ok(registry)
    }

    /// Compile and set up `identifier`, persist the prover and open its ledger.
    pub fn register(&self, identifier: &str, srs: Option<Vec<u8>>) -> Result<Uuid, LedgerError> {
        let artifact = self.backend.compile(identifier)?;
        let key_pair = self.backend.setup(&artifact, srs.as_deref())?;

        let id = Uuid::new_v4();
        let record = ProverRecord {
            id,
            identifier: identifier.to_string(),
            key_ref: format!("prover-{id}"),
            artifact_hash: *blake3::hash(&artifact).as_bytes(),
            artifact,
            proving_key: key_pair.proving_key,
            verifying_key: key_pair.verifying_key,
            srs,
        };

        // Persist first; later steps undo in reverse order on failure.
        let record_key = keys::prover(&id.to_string());
        self.store.insert_new(&record_key, &serde_json::to_vec(&record)?)?;
        if let Err(err) = self.vault.generate_key(&record.key_ref) {
            self.discard_record(&id, &record_key);
            return Err(err.into());
        }
        let ledger = match self.open_ledger(&record) {
            Ok(ledger) => ledger,
            Err(err) => {
                if let Err(vault_err) = self.vault.remove_key(&record.key_ref) {
                    warn!(prover = %id, error = %vault_err, "vault key not removed after failed register");
                }
                self.discard_record(&id, &record_key);
                return Err(err);
            }
        };

        info!(prover = %id, identifier, "registered prover");
        self.write()?.insert(id, ProverEntry { record, ledger });
        Ok(id)
    }

    /// Prove `witness` and record the proof as a note.
    pub fn generate_proof(
        &self,
        id: &Uuid,
        witness: Vec<u8>,
    ) -> Result<(Vec<u8>, RecordReceipt), LedgerError> {
        let (record, ledger) = self.entry(id)?;
        let proof = self.backend.prove(
            &record.artifact,
            &record.proving_key,
            &witness,
            record.srs.as_deref(),
        )?;
        let receipt = ledger.record_proof(&Note::new(proof.clone(), witness))?;
        debug!(prover = %id, index = receipt.index, "proof generated and recorded");
        Ok((proof, receipt))
    }

    pub fn verify(&self, id: &Uuid, proof: &[u8], witness: &[u8]) -> Result<(), LedgerError> {
        let (record, _) = self.entry(id)?;
        self.backend
            .verify(proof, &record.verifying_key, witness, record.srs.as_deref())?;
        Ok(())
    }

    pub fn ledger(&self, id: &Uuid) -> Result<Arc<Ledger>, LedgerError> {
        Ok(self.entry(id)?.1)
    }

    pub fn record(&self, id: &Uuid) -> Result<ProverRecord, LedgerError> {
        Ok(self.entry(id)?.0)
    }

    pub fn ids(&self) -> Result<Vec<Uuid>, LedgerError> {
        let mut ids: Vec<Uuid> = self.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    /// Remove the prover, both of its trees and its vault key.
    ///
    /// The prover stays registered until its rows are gone from the store.
    pub fn destroy(&self, id: &Uuid) -> Result<(), LedgerError> {
        let mut provers = self.write()?;
        if !provers.contains_key(id) {
            return Err(LedgerError::UnknownProver(id.to_string()));
        }

        let rows = Ledger::destroy(&self.store, &id.to_string())?;
        let mut batch = WriteBatch::new();
        batch.delete(keys::prover(&id.to_string()));
        self.store.apply(&batch)?;

        let entry = provers
            .remove(id)
            .ok_or_else(|| LedgerError::UnknownProver(id.to_string()))?;
        drop(provers);
        if !self.vault.remove_key(&entry.record.key_ref)? {
            warn!(prover = %id, "vault held no key for destroyed prover");
        }
        info!(prover = %id, rows, "destroyed prover");
        Ok(())
    }

    fn discard_record(&self, id: &Uuid, record_key: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.delete(record_key.to_vec());
        if let Err(err) = self.store.apply(&batch) {
            warn!(prover = %id, error = %err, "prover record not removed after failed register");
        }
    }

    fn open_ledger(&self, record: &ProverRecord) -> Result<Arc<Ledger>, LedgerError> {
        let params = LedgerParams {
            key_ref: record.key_ref.clone(),
            ..self.config.ledger_params(&record.id.to_string())
        };
        Ok(Arc::new(Ledger::open(
            self.store.clone(),
            params,
            self.vault.clone(),
            self.publisher.clone(),
        )?))
    }

    fn entry(&self, id: &Uuid) -> Result<(ProverRecord, Arc<Ledger>), LedgerError> {
        self.read()?
            .get(id)
            .map(|entry| (entry.record.clone(), entry.ledger.clone()))
            .ok_or_else(|| LedgerError::UnknownProver(id.to_string()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, ProverEntry>>, LedgerError> {
        self.provers
            .read()
            .map_err(|_| LedgerError::LockPoisoned("prover registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, ProverEntry>>, LedgerError> {
        self.provers
            .write()
            .map_err(|_| LedgerError::LockPoisoned("prover registry"))
    }
}
