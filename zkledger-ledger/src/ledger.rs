//! Per-prover note ledger.
//!
//! Every recorded proof becomes an encrypted note appended to the dense
//! `notes-<prover>` tree. Recording a note also spends the note before it: the
//! previous note's plaintext is inserted into the sparse `nullifiers-<prover>`
//! tree under `hash(plaintext)`. A note whose nullifier already exists cannot
//! be spent again.
//!
//! The two trees commit independently. A crash after the append and before the
//! nullifier insert leaves the newest note unspent, which is the normal state
//! of the most recent note anyway.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};
use zkledger_merkle::{DenseProof, Digest, HashKind, SparseProof, TreeError};
use zkledger_store::{drop_tree, PersistentDenseTree, PersistentSparseTree, RecordStore, StoreError};

use crate::{
    events::{NoteEvent, NoteEventKind, Publisher},
    note::{Note, NullifierKey},
    vault::Vault,
    LedgerError,
};

/// Identity and tree parameters for one prover's ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerParams {
    pub prover_id: String,
    /// Vault key the notes are sealed with.
    pub key_ref: String,
    pub subject_prefix: String,
    pub hasher: HashKind,
    pub sparse_depth: usize,
}

impl LedgerParams {
    pub fn notes_tree_id(&self) -> String {
        notes_tree_id(&self.prover_id)
    }

    pub fn nullifiers_tree_id(&self) -> String {
        nullifiers_tree_id(&self.prover_id)
    }
}

pub fn notes_tree_id(prover_id: &str) -> String {
    format!("notes-{prover_id}")
}

pub fn nullifiers_tree_id(prover_id: &str) -> String {
    format!("nullifiers-{prover_id}")
}

/// A note that was marked spent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullifiedNote {
    pub index: usize,
    pub key: NullifierKey,
    pub nullifier_root: Digest,
}

/// Outcome of [`Ledger::record_proof`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordReceipt {
    pub index: usize,
    pub note_root: Digest,
    /// The previous note, spent by this record. `None` for the first note.
    pub nullified: Option<NullifiedNote>,
}

/// Point-in-time summary of both trees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerStatus {
    pub prover_id: String,
    pub note_height: usize,
    pub note_root: Option<Digest>,
    pub nullifier_height: usize,
    pub nullifier_root: Digest,
    pub frozen: bool,
}

pub struct Ledger {
    params: LedgerParams,
    notes: PersistentDenseTree<HashKind>,
    nullifiers: PersistentSparseTree<HashKind>,
    vault: Arc<dyn Vault>,
    publisher: Arc<dyn Publisher>,
    /// Serializes record/nullify transitions so each note has one successor.
    transition: Mutex<()>,
}

impl Ledger {
    /// Load (or create) both trees for `params.prover_id`.
    pub fn open(
        store: RecordStore,
        params: LedgerParams,
        vault: Arc<dyn Vault>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, LedgerError> {
        let notes = PersistentDenseTree::load(store.clone(), params.notes_tree_id(), params.hasher)?;
        let nullifiers = PersistentSparseTree::load(
            store,
            params.nullifiers_tree_id(),
            params.hasher,
            params.sparse_depth,
        )?;
        info!(
            prover = %params.prover_id,
            notes = notes.leaf_count()?,
            nullifiers = nullifiers.len()?,
            "opened ledger"
        );
        Ok(Self {
            params,
            notes,
            nullifiers,
            vault,
            publisher,
            transition: Mutex::new(()),
        })
    }

    /// Remove both trees of `prover_id` from the store.
    pub fn destroy(store: &RecordStore, prover_id: &str) -> Result<usize, LedgerError> {
        Ok(drop_tree(store, &notes_tree_id(prover_id))?
            + drop_tree(store, &nullifiers_tree_id(prover_id))?)
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    /// Record a proof as a new note and spend the previous note.
    ///
    /// 1. Seal the note plaintext with the prover's key.
    /// 2. The previous note is the last dense leaf, if any.
    /// 3. If the previous note is already nullified, fail with `DoubleSpend`
    ///    before anything is written.
    /// 4. Append the sealed note.
    /// 5. Publish `note.deposited`.
    /// 6. Insert the previous note's nullifier and re-check it is present.
    /// 7. Publish `note.nullified`.
    ///
    /// A frozen ledger refuses the record before anything is sealed or written.
    pub fn record_proof(&self, note: &Note) -> Result<RecordReceipt, LedgerError> {
        let _transition = self.lock_transition()?;
        self.ensure_writable()?;

        let plaintext = note.to_plaintext()?;
        let ciphertext = self.vault.encrypt(&self.params.key_ref, &plaintext)?;

        let previous = match self.notes.leaf_count()?.checked_sub(1) {
            Some(index) => {
                let previous_plaintext = self.note_plaintext(index)?;
                let key = self.nullifiers.key_for(&previous_plaintext)?;
                if self.nullifiers.contains(&previous_plaintext)? {
                    warn!(
                        prover = %self.params.prover_id,
                        index,
                        nullifier = %hex::encode(key),
                        "double spend rejected"
                    );
                    return Err(LedgerError::DoubleSpend {
                        index,
                        nullifier: hex::encode(key),
                    });
                }
                Some((index, previous_plaintext, key))
            }
            None => None,
        };

        let (index, note_root) = self.notes.insert(ciphertext)?;
        debug!(prover = %self.params.prover_id, index, "note appended");
        self.emit(NoteEventKind::Deposited, index, note_root, None);

        let nullified = match previous {
            Some((previous_index, previous_plaintext, key)) => {
                Some(self.nullify(previous_index, previous_plaintext, key)?)
            }
            None => None,
        };

        Ok(RecordReceipt {
            index,
            note_root,
            nullified,
        })
    }

    /// Spend the note at `index` directly.
    ///
    /// Repairs a record that appended its note but never committed the
    /// predecessor's nullifier. The newest note is spent by the next
    /// `record_proof`, so nullifying it here fails with `TipNote`.
    pub fn nullify_note(&self, index: usize) -> Result<NullifiedNote, LedgerError> {
        let _transition = self.lock_transition()?;
        self.ensure_writable()?;
        let height = self.notes.leaf_count()?;
        if index + 1 == height {
            return Err(LedgerError::TipNote { index });
        }
        let plaintext = self.note_plaintext(index)?;
        let key = self.nullifiers.key_for(&plaintext)?;
        self.nullify(index, plaintext, key)
    }

    pub fn note_height(&self) -> Result<usize, LedgerError> {
        Ok(self.notes.leaf_count()?)
    }

    pub fn note_root(&self) -> Result<Digest, LedgerError> {
        Ok(self.notes.root()?)
    }

    /// Decrypted plaintext of the note at `index` and its nullifier key.
    pub fn note_value_at(&self, index: usize) -> Result<(Vec<u8>, NullifierKey), LedgerError> {
        let plaintext = self.note_plaintext(index)?;
        let key = self.nullifiers.key_for(&plaintext)?;
        Ok((plaintext, key))
    }

    pub fn note_at(&self, index: usize) -> Result<Note, LedgerError> {
        Note::from_plaintext(&self.note_plaintext(index)?)
    }

    /// Sealed note bytes as stored in the dense tree.
    pub fn note_ciphertext_at(&self, index: usize) -> Result<Vec<u8>, LedgerError> {
        Ok(self.notes.value_at(index)?)
    }

    pub fn note_proof(&self, index: usize) -> Result<DenseProof, LedgerError> {
        Ok(self.notes.proof(index)?)
    }

    /// Check that `ciphertext` sits at `index` under the current note root.
    pub fn validate_note(
        &self,
        ciphertext: &[u8],
        index: usize,
        siblings: &[Digest],
    ) -> Result<bool, LedgerError> {
        Ok(self.notes.validate_existence(ciphertext, index, siblings)?)
    }

    pub fn nullifier_height(&self) -> Result<usize, LedgerError> {
        Ok(self.nullifiers.len()?)
    }

    pub fn nullifier_root(&self) -> Result<Digest, LedgerError> {
        Ok(self.nullifiers.root()?)
    }

    /// Value stored under a nullifier key (the spent note's plaintext).
    pub fn nullifier_value_at(&self, key: &NullifierKey) -> Result<Vec<u8>, LedgerError> {
        Ok(self.nullifiers.get(key)?)
    }

    pub fn nullifier_proof(&self, key: &NullifierKey) -> Result<SparseProof, LedgerError> {
        Ok(self.nullifiers.prove(key)?)
    }

    /// Check a nullifier proof against `root`; `value = None` proves absence.
    pub fn verify_nullifier_proof(
        &self,
        proof: &SparseProof,
        root: &Digest,
        key: &NullifierKey,
        value: Option<&[u8]>,
    ) -> Result<bool, LedgerError> {
        Ok(self.nullifiers.verify_proof(proof, root, key, value)?)
    }

    pub fn is_spent(&self, index: usize) -> Result<bool, LedgerError> {
        let plaintext = self.note_plaintext(index)?;
        Ok(self.nullifiers.contains(&plaintext)?)
    }

    pub fn is_frozen(&self) -> bool {
        self.notes.is_frozen() || self.nullifiers.is_frozen()
    }

    /// Re-verify both in-memory trees; a failing tree is frozen.
    pub fn verify(&self) -> Result<(), LedgerError> {
        self.notes.verify()?;
        self.nullifiers.verify()?;
        Ok(())
    }

    pub fn status(&self) -> Result<LedgerStatus, LedgerError> {
        let note_root = match self.notes.root() {
            Ok(root) => Some(root),
            Err(StoreError::Tree(TreeError::EmptyTree)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(LedgerStatus {
            prover_id: self.params.prover_id.clone(),
            note_height: self.notes.leaf_count()?,
            note_root,
            nullifier_height: self.nullifiers.len()?,
            nullifier_root: self.nullifiers.root()?,
            frozen: self.is_frozen(),
        })
    }

    fn nullify(
        &self,
        index: usize,
        plaintext: Vec<u8>,
        key: NullifierKey,
    ) -> Result<NullifiedNote, LedgerError> {
        let update = match self.nullifiers.insert_unique(key, plaintext.clone()) {
            Ok(update) => update,
            Err(StoreError::Tree(TreeError::KeyExists(_))) => {
                warn!(prover = %self.params.prover_id, index, "note already nullified");
                return Err(LedgerError::DoubleSpend {
                    index,
                    nullifier: hex::encode(key),
                });
            }
            Err(err) => return Err(err.into()),
        };

        self.confirm_nullified(index, &plaintext, &key)?;

        debug!(prover = %self.params.prover_id, index, nullifier = %hex::encode(key), "note nullified");
        self.emit(NoteEventKind::Nullified, index, update.root, Some(key));
        Ok(NullifiedNote {
            index,
            key,
            nullifier_root: update.root,
        })
    }

    /// Re-prove a freshly inserted nullifier; failure freezes the nullifier tree.
    fn confirm_nullified(
        &self,
        index: usize,
        plaintext: &[u8],
        key: &NullifierKey,
    ) -> Result<(), LedgerError> {
        let reason = match self.nullifiers.contains(plaintext) {
            Ok(true) => return Ok(()),
            Ok(false) => format!("nullifier {} not provable after insert", hex::encode(key)),
            Err(err) if err.is_integrity() => {
                format!("nullifier {} unreadable after insert: {err}", hex::encode(key))
            }
            Err(err) => return Err(err.into()),
        };
        error!(prover = %self.params.prover_id, index, %reason, "nullifier tree inconsistent");
        self.nullifiers.freeze(&reason);
        Err(LedgerError::Integrity(reason))
    }

    fn ensure_writable(&self) -> Result<(), LedgerError> {
        if self.is_frozen() {
            return Err(LedgerError::Integrity(format!(
                "ledger for prover {} is frozen after an integrity failure",
                self.params.prover_id
            )));
        }
        Ok(())
    }

    fn note_plaintext(&self, index: usize) -> Result<Vec<u8>, LedgerError> {
        let ciphertext = self.notes.value_at(index)?;
        Ok(self.vault.decrypt(&self.params.key_ref, &ciphertext)?)
    }

    fn emit(&self, kind: NoteEventKind, index: usize, root: Digest, nullifier: Option<NullifierKey>) {
        let event = NoteEvent {
            prover_id: self.params.prover_id.clone(),
            kind,
            index,
            root,
            nullifier: nullifier.map(hex::encode),
        };
        let subject = event.subject(&self.params.subject_prefix);
        let published = serde_json::to_vec(&event)
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                self.publisher
                    .publish(&subject, &payload)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = published {
            warn!(%subject, error = %err, "note event not published");
        }
    }

    fn lock_transition(&self) -> Result<MutexGuard<'_, ()>, LedgerError> {
        self.transition
            .lock()
            .map_err(|_| LedgerError::LockPoisoned("ledger transition"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::NoopPublisher, vault::MemoryVault, Vault};
    use zkledger_merkle::HashStrategy;

    fn ledger(store: &RecordStore, vault: &Arc<MemoryVault>) -> Ledger {
        let params = LedgerParams {
            prover_id: "p1".into(),
            key_ref: "p1".into(),
            subject_prefix: "test".into(),
            hasher: HashKind::Sha256,
            sparse_depth: 256,
        };
        Ledger::open(store.clone(), params, vault.clone(), Arc::new(NoopPublisher)).unwrap()
    }

    fn vault() -> Arc<MemoryVault> {
        let vault = MemoryVault::new();
        vault.set_key("p1", &[9u8; 32]).unwrap();
        Arc::new(vault)
    }

    #[test]
    fn test_first_note_nullifies_nothing() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let receipt = ledger.record_proof(&Note::new(b"p".to_vec(), b"w".to_vec())).unwrap();
        assert_eq!(receipt.index, 0);
        assert!(receipt.nullified.is_none());
        assert_eq!(ledger.nullifier_height().unwrap(), 0);
    }

    #[test]
    fn test_second_note_spends_first() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let a = Note::new(b"pa".to_vec(), b"wa".to_vec());
        ledger.record_proof(&a).unwrap();
        let receipt = ledger.record_proof(&Note::new(b"pb".to_vec(), b"wb".to_vec())).unwrap();

        let nullified = receipt.nullified.unwrap();
        assert_eq!(nullified.index, 0);
        assert!(ledger.is_spent(0).unwrap());
        assert!(!ledger.is_spent(1).unwrap());
        assert_eq!(ledger.nullifier_value_at(&nullified.key).unwrap(), a.to_plaintext().unwrap());
    }

    #[test]
    fn test_note_value_round_trips_through_vault() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let note = Note::new(b"proof".to_vec(), b"witness".to_vec());
        ledger.record_proof(&note).unwrap();

        let (plaintext, key) = ledger.note_value_at(0).unwrap();
        assert_eq!(plaintext, note.to_plaintext().unwrap());
        assert_eq!(key, HashKind::Sha256.digest(&plaintext));
        assert_eq!(ledger.note_at(0).unwrap(), note);
        assert_ne!(ledger.note_ciphertext_at(0).unwrap(), plaintext);
    }

    #[test]
    fn test_missing_vault_key_writes_nothing() {
        let store = RecordStore::in_memory();
        let ledger = ledger(&store, &Arc::new(MemoryVault::new()));
        let err = ledger.record_proof(&Note::new(b"p".to_vec(), b"w".to_vec())).unwrap_err();
        assert!(matches!(err, LedgerError::Crypto(_)));
        assert_eq!(ledger.note_height().unwrap(), 0);
        assert!(store.scan_prefix(b"dense/").unwrap().is_empty());
    }

    #[test]
    fn test_frozen_nullifier_tree_blocks_records() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        ledger.record_proof(&Note::new(b"pa".to_vec(), b"wa".to_vec())).unwrap();
        ledger.nullifiers.freeze("test");

        for attempt in 0..3u8 {
            let err = ledger
                .record_proof(&Note::new(vec![attempt], b"w".to_vec()))
                .unwrap_err();
            assert!(matches!(err, LedgerError::Integrity(_)));
            assert_eq!(err.kind(), crate::ErrorKind::Integrity);
        }
        assert_eq!(ledger.note_height().unwrap(), 1);
        assert_eq!(ledger.nullifier_height().unwrap(), 0);
        assert!(matches!(ledger.nullify_note(0), Err(LedgerError::Integrity(_))));
        assert!(ledger.status().unwrap().frozen);
    }

    #[test]
    fn test_failed_reverification_freezes_nullifiers() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let note = Note::new(b"pa".to_vec(), b"wa".to_vec());
        ledger.record_proof(&note).unwrap();

        // A plaintext that was never inserted cannot be re-proven.
        let plaintext = note.to_plaintext().unwrap();
        let key = ledger.nullifiers.key_for(&plaintext).unwrap();
        let err = ledger.confirm_nullified(0, &plaintext, &key).unwrap_err();

        assert!(matches!(err, LedgerError::Integrity(_)));
        assert!(ledger.is_frozen());
        assert!(ledger.nullifiers.is_frozen());
        assert!(!ledger.notes.is_frozen());
        assert!(matches!(
            ledger.record_proof(&Note::new(b"pb".to_vec(), b"wb".to_vec())),
            Err(LedgerError::Integrity(_))
        ));
        assert_eq!(ledger.note_height().unwrap(), 1);
    }

    #[test]
    fn test_reverification_passes_after_insert() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let a = Note::new(b"pa".to_vec(), b"wa".to_vec());
        ledger.record_proof(&a).unwrap();
        let receipt = ledger.record_proof(&Note::new(b"pb".to_vec(), b"wb".to_vec())).unwrap();
        let key = receipt.nullified.unwrap().key;

        ledger
            .confirm_nullified(0, &a.to_plaintext().unwrap(), &key)
            .unwrap();
        assert!(!ledger.is_frozen());
    }

    #[test]
    fn test_nullify_note_rejects_tip() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        ledger.record_proof(&Note::new(b"pa".to_vec(), b"wa".to_vec())).unwrap();

        let err = ledger.nullify_note(0).unwrap_err();
        assert!(matches!(err, LedgerError::TipNote { index: 0 }));
        assert_eq!(err.kind(), crate::ErrorKind::Structural);
        assert_eq!(ledger.nullifier_height().unwrap(), 0);

        let receipt = ledger.record_proof(&Note::new(b"pb".to_vec(), b"wb".to_vec())).unwrap();
        assert_eq!(receipt.nullified.map(|n| n.index), Some(0));
    }

    #[test]
    fn test_nullify_note_repairs_interrupted_record() {
        let vault = vault();
        let ledger = ledger(&RecordStore::in_memory(), &vault);
        ledger.record_proof(&Note::new(b"pa".to_vec(), b"wa".to_vec())).unwrap();

        // Append a successor without committing the predecessor's nullifier.
        let successor = Note::new(b"pb".to_vec(), b"wb".to_vec()).to_plaintext().unwrap();
        ledger
            .notes
            .insert(vault.encrypt("p1", &successor).unwrap())
            .unwrap();
        assert!(!ledger.is_spent(0).unwrap());

        let spent = ledger.nullify_note(0).unwrap();
        assert_eq!(spent.index, 0);
        assert!(ledger.is_spent(0).unwrap());
        assert!(matches!(
            ledger.nullify_note(0),
            Err(LedgerError::DoubleSpend { index: 0, .. })
        ));
        assert!(matches!(ledger.nullify_note(1), Err(LedgerError::TipNote { index: 1 })));
    }

    #[test]
    fn test_status_of_empty_ledger() {
        let ledger = ledger(&RecordStore::in_memory(), &vault());
        let status = ledger.status().unwrap();
        assert_eq!(status.note_height, 0);
        assert_eq!(status.note_root, None);
        assert!(!status.frozen);
        assert!(matches!(ledger.note_root(), Err(LedgerError::Structural(TreeError::EmptyTree))));
    }
}
